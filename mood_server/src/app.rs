//! Mood detection and playback, tied together.
//!
use std::{
    fmt,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use common::protocol::{DetectReport, Song, SongsView, StatusView};
use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};

use crate::{
    frames::FrameHub,
    nn::{Bbox, ExpressionDetector, FaceExpression},
    player::{AudioOutput, PlayerEvent},
    playlist::{PlaybackToken, SongList, Toggle},
    songs::SongsClient,
};

pub const BUSY_MESSAGE: &str = "Mood detection is already running.";
pub const NO_FACE_MESSAGE: &str = "No face detected. Please ensure your face is visible.";
pub const FAILURE_MESSAGE: &str = "An error occurred during mood detection.";

/// Why a mood detection did not produce songs.
#[derive(Debug)]
pub enum DetectError {
    /// Another detection is still running.
    Busy,
    /// The analysed frame contains no face.
    NoFace,
    /// Inference or the songs request failed.
    Failed(anyhow::Error),
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            DetectError::Busy => BUSY_MESSAGE,
            DetectError::NoFace => NO_FACE_MESSAGE,
            DetectError::Failed(_) => FAILURE_MESSAGE,
        };
        f.write_str(message)
    }
}

impl std::error::Error for DetectError {}

pub struct MoodApp {
    detector: Arc<dyn ExpressionDetector>,
    frames: FrameHub,
    songs: SongsClient,
    output: Arc<dyn AudioOutput>,
    playlist: Mutex<SongList>,
    status: Mutex<StatusView>,
}

impl MoodApp {
    pub fn new(
        detector: Arc<dyn ExpressionDetector>,
        frames: FrameHub,
        songs: SongsClient,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            detector,
            frames,
            songs,
            output,
            playlist: Mutex::new(SongList::new()),
            status: Mutex::new(StatusView::default()),
        }
    }

    pub fn frames(&self) -> &FrameHub {
        &self.frames
    }

    pub fn status(&self) -> StatusView {
        self.status.lock().unwrap().clone()
    }

    pub fn songs(&self) -> SongsView {
        self.playlist.lock().unwrap().view()
    }

    /// Detect the mood on the latest frame and replace the song list with matching songs.
    pub async fn detect_mood(&self) -> Result<DetectReport, DetectError> {
        let _loading = self.start_loading()?;

        let result = self.run_detection().await;
        if let Err(e) = &result {
            match e {
                DetectError::Failed(cause) => log::error!("Mood detection failed: {cause:#}"),
                _ => log::info!("Mood detection aborted: {e}"),
            }
            self.status.lock().unwrap().error = Some(e.to_string());
        }

        result
    }

    /// Set the loading flag, clearing the outcome of the previous detection.
    fn start_loading(&self) -> Result<LoadingGuard<'_>, DetectError> {
        let mut status = self.status.lock().unwrap();
        if status.loading {
            return Err(DetectError::Busy);
        }
        *status = StatusView {
            loading: true,
            mood: None,
            error: None,
        };

        Ok(LoadingGuard(&self.status))
    }

    async fn run_detection(&self) -> Result<DetectReport, DetectError> {
        let jpeg = self
            .frames
            .latest()
            .ok_or_else(|| DetectError::Failed(anyhow!("no camera frame captured yet")))?;

        let detector = Arc::clone(&self.detector);
        let analysis = tokio::task::spawn_blocking(move || analyze_frame(detector.as_ref(), &jpeg))
            .await
            .map_err(|e| DetectError::Failed(e.into()))?
            .map_err(DetectError::Failed)?;
        let (face, annotated) = analysis.ok_or(DetectError::NoFace)?;

        let mood = face
            .scores
            .dominant()
            .ok_or_else(|| DetectError::Failed(anyhow!("all expression scores are zero")))?;
        log::info!(
            "Detected mood {} on face with confidence {:.2}",
            mood,
            face.confidence
        );

        self.status.lock().unwrap().mood = Some(mood);
        if let Some(annotated) = annotated {
            self.frames.set_analyzed(annotated);
        }

        let songs = self.songs.fetch(mood).await.map_err(DetectError::Failed)?;

        let was_playing = self.playlist.lock().unwrap().replace(songs.clone());
        if was_playing {
            self.stop_output();
        }

        Ok(DetectReport {
            mood,
            emoji: mood.emoji().into(),
            scores: face.scores,
            songs,
        })
    }

    /// Play or pause the song at `index`. Fails if there is no such song.
    pub fn toggle(self: &Arc<Self>, index: usize) -> Result<SongsView> {
        let (toggle, was_playing, view) = {
            let mut playlist = self.playlist.lock().unwrap();
            let was_playing = playlist.playing().is_some();
            let toggle = playlist.toggle(index)?;
            (toggle, was_playing, playlist.view())
        };

        match toggle {
            Toggle::Stopped => {
                log::info!("Pausing song {}", index);
                self.stop_output();
            }
            Toggle::Started { token, song } => {
                log::info!("Playing song {} ({:?} by {:?})", index, song.title, song.artist);
                // Silence the previous song before the new audio is fetched
                if was_playing {
                    self.stop_output();
                }
                let app = Arc::clone(self);
                tokio::spawn(async move { app.start_playback(token, song).await });
            }
        }

        Ok(view)
    }

    async fn start_playback(&self, token: PlaybackToken, song: Song) {
        let result = match self.songs.fetch_audio(&song).await {
            Ok(audio) => {
                // Play under the lock, so a later pause is always sent after it
                let playlist = self.playlist.lock().unwrap();
                if !playlist.is_current(token) {
                    log::debug!("Song {:?} was paused before its audio arrived", song.title);
                    return;
                }
                self.output.play(token, audio)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            log::warn!("Unable to play {:?}: {e:#}", song.title);
            if self.playlist.lock().unwrap().finished(token) {
                self.stop_output();
            }
        }
    }

    pub fn handle_player_event(&self, event: PlayerEvent) {
        let token = match &event {
            PlayerEvent::Ended { token } => *token,
            PlayerEvent::Failed { token, reason } => {
                log::warn!("Playback failed: {reason}");
                *token
            }
        };

        if self.playlist.lock().unwrap().finished(token) {
            log::debug!("Playback {} is over", token);
        }
    }

    fn stop_output(&self) {
        if let Err(e) = self.output.stop() {
            log::warn!("Unable to stop playback: {e:#}");
        }
    }
}

/// Forward events of the audio output to the app.
pub fn spawn_player_events(
    app: Arc<MoodApp>,
    mut events: UnboundedReceiver<PlayerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            app.handle_player_event(event);
        }
    })
}

/// Resets the loading flag when the detection is over, also if its future is dropped.
struct LoadingGuard<'a>(&'a Mutex<StatusView>);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut status) = self.0.lock() {
            status.loading = false;
        }
    }
}

/// Decode the frame and find the face expression on it.
///
/// Along with the face comes the frame with the face box drawn, unless encoding it failed.
fn analyze_frame(
    detector: &dyn ExpressionDetector,
    jpeg: &[u8],
) -> Result<Option<(FaceExpression, Option<Bytes>)>> {
    let frame: RgbImage = turbojpeg::decompress_image(jpeg)?;

    let Some(face) = detector.detect(&frame)? else {
        return Ok(None);
    };

    let annotated = match draw_face_on_image(frame, &face.bbox) {
        Ok(annotated) => Some(annotated),
        Err(e) => {
            log::warn!("Unable to encode analysed frame: {e}");
            None
        }
    };

    Ok(Some((face, annotated)))
}

/// Draw the face box on the frame and encode it as JPEG.
fn draw_face_on_image(mut frame: RgbImage, bbox: &Bbox) -> Result<Bytes> {
    let (width, height) = (frame.width() as f32, frame.height() as f32);
    let color = Rgb::from([0, 255, 0]);

    // Coordinate frame basis is on the top left corner
    let (x_tl, y_tl) = (bbox[0] * width, bbox[1] * height);
    let (x_br, y_br) = (bbox[2] * width, bbox[3] * height);
    let rect_width = (x_br - x_tl).max(1.0) as u32;
    let rect_height = (y_br - y_tl).max(1.0) as u32;

    draw_hollow_rect_mut(
        &mut frame,
        Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width, rect_height),
        color,
    );

    let buf = turbojpeg::compress_image(&frame, 95, turbojpeg::Subsamp::Sub2x2)?;

    Ok(Bytes::copy_from_slice(&buf))
}
