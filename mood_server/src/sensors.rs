//! Sensors module.
//!
use std::{thread, time::Duration};

use bytes::Bytes;
use rscam::{Camera, Config, Frame};
use simple_error::simple_error;

use crate::{frames::FrameHub, meter::METER, Error};

pub type CaptureFn = Box<dyn Fn() -> Option<Frame> + Send + Sync>;

/// Pause after a failed capture before trying again.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Camera settings. Unset resolution and frame rate default to the maximum the device supports.
#[derive(Clone, Debug)]
pub struct CameraSettings {
    pub device: String,
    pub format: String,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<(u32, u32)>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            format: "MJPG".into(),
            resolution: None,
            frame_rate: None,
        }
    }
}

/// Get a capture function to a video device on a Linux machine.
pub fn get_capture_fn_linux(settings: &CameraSettings) -> Result<CaptureFn, Error> {
    let mut cam = Camera::new(&settings.device)?;
    log_supported_formats(&cam, &settings.format);
    let format = settings.format.as_bytes();

    log::info!("Using camera {}", &settings.device);

    let resolution = settings
        .resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, format))?;

    let frame_rate = settings
        .frame_rate
        .map(Ok)
        .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

    log::info!(
        "Capturing {}x{} at {}/{} s per frame",
        resolution.0,
        resolution.1,
        frame_rate.0,
        frame_rate.1
    );

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format,
        ..Default::default()
    })?;

    let callback = move || cam.capture().ok();
    Ok(Box::new(callback))
}

/// Capture frames on a dedicated thread and publish them to the frame hub.
///
/// The thread runs until the process exits.
pub fn spawn_capture_loop(capture_fn: CaptureFn, hub: FrameHub) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match capture_fn() {
            Some(frame) => {
                METER.tick_captured();
                hub.publish(Bytes::copy_from_slice(&frame[..]));
            }
            None => {
                log::error!("Unable to capture frame, trying again...");
                thread::sleep(CAPTURE_RETRY_DELAY);
            }
        }
    })
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Map to iterator over ((width, height) num_pixels)
            .map(|res| (res, res.0 * res.1))
            // Get the highest resolution in terms of number of pixels
            .max_by(|a, b| a.1.cmp(&b.1))
            // Extract width and height values
            .map(|res| *res.0),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds per frame, so the shortest one wins
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .filter(|(numerator, _)| *numerator > 0)
            .max_by(|a, b| (a.1 * b.0).cmp(&(b.1 * a.0)))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}
