use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

/// Frame counters of the camera and its live stream viewers.
#[derive(Default)]
pub struct Meter {
    captured_frames: AtomicU64,
    streamed_frames: AtomicU64,
    skipped_frames: AtomicU64,
}

/// Counts taken from a [`Meter`] since the previous reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeterReading {
    pub captured: u64,
    pub streamed: u64,
    /// Frames slow stream viewers fell behind on.
    pub skipped: u64,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            captured_frames: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
            skipped_frames: AtomicU64::new(0),
        }
    }

    pub fn tick_captured(&self) {
        self.captured_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped(&self, frames: u64) {
        self.skipped_frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Read all counters and reset them.
    pub fn take(&self) -> MeterReading {
        MeterReading {
            captured: self.captured_frames.swap(0, Ordering::Relaxed),
            streamed: self.streamed_frames.swap(0, Ordering::Relaxed),
            skipped: self.skipped_frames.swap(0, Ordering::Relaxed),
        }
    }
}

impl MeterReading {
    pub fn is_idle(&self) -> bool {
        *self == MeterReading::default()
    }

    /// One log line with the rates over `elapsed` seconds.
    pub fn summary(&self, elapsed: f32) -> String {
        let mut line = format!(
            "Frames per second: {:.2} captured, {:.2} streamed",
            self.captured as f32 / elapsed,
            self.streamed as f32 / elapsed
        );
        if self.skipped > 0 {
            line.push_str(&format!(", {} skipped by slow viewers", self.skipped));
        }
        line
    }
}

pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;

        loop {
            let start = Instant::now();
            log_interval.tick().await;

            let reading = METER.take();
            if !reading.is_idle() {
                log::info!("{}", reading.summary(start.elapsed().as_secs_f32()));
            }
        }
    })
}
