//! Face detection and facial expression classification.
//!
//! Two ONNX models are chained: Ultraface finds faces in the full frame, FER+ classifies the
//! expression of the most confident face. Both models are run with `tract`.
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use common::protocol::{Expression, ExpressionScores};
use image::{imageops::FilterType, GrayImage, RgbImage};
use ndarray::s;
use reqwest::Client;
use tract_onnx::prelude::*;

use crate::utils::download_file;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Bounding box `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`, normalized to the
/// image size.
pub type Bbox = [f32; 4];

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

pub const ULTRAFACE_FILE: &str = "version-RFB-320.onnx";
const ULTRAFACE_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

pub const FERPLUS_FILE: &str = "emotion-ferplus-8.onnx";
const FERPLUS_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/emotion_ferplus/model/emotion-ferplus-8.onnx";

/// Side length of the square grayscale input of FER+.
const FERPLUS_SIDE: u32 = 64;

/// Share of the face box added on every side before cropping.
const FACE_PADDING: f32 = 0.1;

/// Expression per FER+ output slot. `None` for `contempt`, which is not a mood.
const FERPLUS_CLASSES: [Option<Expression>; 8] = [
    Some(Expression::Neutral),
    Some(Expression::Happy),
    Some(Expression::Surprised),
    Some(Expression::Sad),
    Some(Expression::Angry),
    Some(Expression::Disgusted),
    Some(Expression::Fearful),
    None,
];

pub trait InferModel {
    type Output;

    fn run(&self, input: &RgbImage) -> Result<Self::Output>;
}

/// Expression of a single face found in a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceExpression {
    pub bbox: Bbox,
    pub confidence: f32,
    pub scores: ExpressionScores,
}

/// Anything that can find a face in a frame and score its expression.
pub trait ExpressionDetector: Send + Sync {
    /// Returns `None` if there is no face in the frame.
    fn detect(&self, frame: &RgbImage) -> Result<Option<FaceExpression>>;
}

pub struct UltrafaceModel {
    model: NnModel,
    width: u32,
    height: u32,
    max_iou: f32,
    min_confidence: f32,
}

impl UltrafaceModel {
    pub fn load(path: &Path, max_iou: f32, min_confidence: f32) -> Result<Self> {
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, 240, 320));
        let model = load_onnx_model(path, input_fact)?;

        Ok(Self {
            model,
            width: 320,
            height: 240,
            max_iou,
            min_confidence,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage =
            image::imageops::resize(input, self.width, self.height, FilterType::Triangle);

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| {
                // Note: Mean/std are from MobileNet, not from Ultraface, but work well
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            },
        )
        .into()
    }
}

impl InferModel for UltrafaceModel {
    /// Faces with confidences, most confident first.
    type Output = Vec<(Bbox, f32)>;

    fn run(&self, input: &RgbImage) -> Result<Self::Output> {
        let raw_nn_out = self.model.run(tvec!(self.preproc(input).into()))?;

        // Output 0 holds `[background, face]` confidences per anchor, output 1 the anchor boxes
        let confidences = raw_nn_out[0]
            .to_array_view::<f32>()?
            .slice(s![0, .., 1])
            .to_vec();
        let bboxes: Vec<f32> = raw_nn_out[1]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();

        Ok(select_faces(
            &confidences,
            &bboxes,
            self.min_confidence,
            self.max_iou,
        ))
    }
}

/// FER+ expression classifier.
pub struct FerPlusModel {
    model: NnModel,
}

impl FerPlusModel {
    pub fn load(path: &Path) -> Result<Self> {
        let input_fact = InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 1, 64, 64));
        let model = load_onnx_model(path, input_fact)?;

        Ok(Self { model })
    }

    /// Classify a grayscale face crop of `FERPLUS_SIDE` x `FERPLUS_SIDE` pixels.
    pub fn classify(&self, face: &GrayImage) -> Result<ExpressionScores> {
        let side = FERPLUS_SIDE as usize;
        // FER+ expects raw pixel values, no normalization
        let tensor: Tensor =
            tract_ndarray::Array4::from_shape_fn((1, 1, side, side), |(_, _, y, x)| {
                face[(x as _, y as _)][0] as f32
            })
            .into();

        let raw_nn_out = self.model.run(tvec!(tensor.into()))?;
        let logits: Vec<f32> = raw_nn_out[0]
            .to_array_view::<f32>()?
            .iter()
            .cloned()
            .collect();

        if logits.len() != FERPLUS_CLASSES.len() {
            bail!(
                "expected {} expression logits, got {}",
                FERPLUS_CLASSES.len(),
                logits.len()
            );
        }

        Ok(ferplus_scores(&softmax(&logits)))
    }
}

/// Face detector chained with the expression classifier.
pub struct FaceExpressionModel {
    faces: UltrafaceModel,
    expressions: FerPlusModel,
}

impl FaceExpressionModel {
    /// Load both models from `model_dir`, downloading missing files if `download` is set.
    pub async fn load(model_dir: &Path, download: bool) -> Result<Self> {
        let client = Client::new();
        let ultraface_path =
            ensure_model_file(&client, model_dir, ULTRAFACE_FILE, ULTRAFACE_URL, download).await?;
        let ferplus_path =
            ensure_model_file(&client, model_dir, FERPLUS_FILE, FERPLUS_URL, download).await?;

        // Optimizing the graphs takes a while
        tokio::task::spawn_blocking(move || {
            let faces = UltrafaceModel::load(&ultraface_path, 0.5, 0.5)?;
            let expressions = FerPlusModel::load(&ferplus_path)?;
            log::info!("Loaded face and expression models");

            Ok::<_, anyhow::Error>(Self { faces, expressions })
        })
        .await?
    }
}

impl ExpressionDetector for FaceExpressionModel {
    fn detect(&self, frame: &RgbImage) -> Result<Option<FaceExpression>> {
        let faces = self.faces.run(frame)?;
        log::debug!("Found {} faces in image", faces.len());

        let (bbox, confidence) = match faces.first() {
            Some(face) => *face,
            None => return Ok(None),
        };

        let crop = match crop_face(frame, &bbox, FACE_PADDING) {
            Some(crop) => crop,
            None => {
                log::debug!("Face box {:?} is empty after clamping", bbox);
                return Ok(None);
            }
        };

        let scores = self.expressions.classify(&crop)?;

        Ok(Some(FaceExpression {
            bbox,
            confidence,
            scores,
        }))
    }
}

fn load_onnx_model(path: &Path, input_fact: InferenceFact) -> Result<NnModel> {
    let model = tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

async fn ensure_model_file(
    client: &Client,
    model_dir: &Path,
    filename: &str,
    url: &str,
    download: bool,
) -> Result<PathBuf> {
    let filepath = model_dir.join(filename);
    if filepath.exists() {
        return Ok(filepath);
    }
    if !download {
        bail!("model file {} not found", filepath.display());
    }

    log::info!("Downloading {} to {}", url, filepath.display());
    tokio::fs::create_dir_all(model_dir).await?;
    download_file(client, url, &filepath).await?;

    Ok(filepath)
}

/// Filter anchor boxes by confidence and reduce overlapping ones.
///
/// `bboxes` holds four coordinates per entry of `confidences`.
fn select_faces(
    confidences: &[f32],
    bboxes: &[f32],
    min_confidence: f32,
    max_iou: f32,
) -> Vec<(Bbox, f32)> {
    let mut candidates: Vec<(Bbox, f32)> = bboxes
        .chunks_exact(4)
        .zip(confidences.iter())
        .filter(|(_, confidence)| **confidence > min_confidence)
        .map(|(bbox, confidence)| ([bbox[0], bbox[1], bbox[2], bbox[3]], *confidence))
        .collect();

    candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

    non_maximum_suppression(candidates, max_iou)
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Candidates must be sorted by ascending confidence. Starting with the most confident bounding
/// box, a candidate is selected only if its IoU with every already selected box is at most
/// `max_iou`. The result is ordered by descending confidence.
fn non_maximum_suppression(
    mut sorted_bboxes_with_confidences: Vec<(Bbox, f32)>,
    max_iou: f32,
) -> Vec<(Bbox, f32)> {
    let mut selected: Vec<(Bbox, f32)> = vec![];
    'candidates: while let Some((bbox, confidence)) = sorted_bboxes_with_confidences.pop() {
        for (selected_bbox, _) in selected.iter() {
            if iou(&bbox, selected_bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push((bbox, confidence));
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // If the boxes do not overlap, the overlap box is ill defined and its area is zero
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box, zero for ill-defined boxes.
fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    exps.into_iter().map(|x| x / sum).collect()
}

fn ferplus_scores(probabilities: &[f32]) -> ExpressionScores {
    let mut scores = ExpressionScores::default();
    for (class, probability) in FERPLUS_CLASSES.iter().zip(probabilities) {
        if let Some(expression) = class {
            scores.set(*expression, *probability);
        }
    }

    scores
}

/// Cut the padded face box out of the frame as a grayscale FER+ input.
///
/// Returns `None` if nothing of the box is left after clamping to the frame.
pub fn crop_face(frame: &RgbImage, bbox: &Bbox, padding: f32) -> Option<GrayImage> {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let pad_x = (bbox[2] - bbox[0]) * padding;
    let pad_y = (bbox[3] - bbox[1]) * padding;

    let x_tl = ((bbox[0] - pad_x) * width).clamp(0.0, width);
    let y_tl = ((bbox[1] - pad_y) * height).clamp(0.0, height);
    let x_br = ((bbox[2] + pad_x) * width).clamp(0.0, width);
    let y_br = ((bbox[3] + pad_y) * height).clamp(0.0, height);

    let crop_width = (x_br - x_tl) as u32;
    let crop_height = (y_br - y_tl) as u32;
    if crop_width == 0 || crop_height == 0 {
        return None;
    }

    let crop = image::imageops::crop_imm(frame, x_tl as u32, y_tl as u32, crop_width, crop_height)
        .to_image();
    let gray = image::imageops::grayscale(&crop);

    Some(image::imageops::resize(
        &gray,
        FERPLUS_SIDE,
        FERPLUS_SIDE,
        FilterType::Triangle,
    ))
}
