//! Distribution of camera frames to the live stream and to mood detection.
//!
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

pub type BroadcastSender = broadcast::Sender<Bytes>;
pub type BroadcastReceiver = broadcast::Receiver<Bytes>;

/// Number of stream items a slow viewer may lag behind before frames are skipped.
const STREAM_CAPACITY: usize = 20;

/// Fan-out point for JPEG frames coming from the camera.
///
/// Live viewers subscribe to a broadcast of ready-made multipart items, mood detection reads the
/// most recent frame. Cloning the hub gives another handle to the same channels.
#[derive(Clone)]
pub struct FrameHub {
    latest_tx: Arc<watch::Sender<Option<Bytes>>>,
    latest_rx: watch::Receiver<Option<Bytes>>,
    stream_tx: BroadcastSender,
    analyzed: Arc<Mutex<Option<Bytes>>>,
}

impl FrameHub {
    pub fn new() -> Self {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (stream_tx, _) = broadcast::channel(STREAM_CAPACITY);

        Self {
            latest_tx: Arc::new(latest_tx),
            latest_rx,
            stream_tx,
            analyzed: Arc::new(Mutex::new(None)),
        }
    }

    /// Publish a new JPEG frame.
    pub fn publish(&self, jpeg: Bytes) {
        if self.stream_tx.receiver_count() > 0 {
            // Only fails if the last viewer left in the meantime
            self.stream_tx.send(as_jpeg_stream_item(&jpeg)).ok();
        }
        self.latest_tx.send_replace(Some(jpeg));
    }

    /// Most recent JPEG frame, `None` before the first capture.
    pub fn latest(&self) -> Option<Bytes> {
        self.latest_rx.borrow().clone()
    }

    /// Subscribe to the live stream of multipart items.
    pub fn subscribe(&self) -> BroadcastReceiver {
        self.stream_tx.subscribe()
    }

    /// Keep the JPEG of the frame the last mood was detected on.
    pub fn set_analyzed(&self, jpeg: Bytes) {
        *self.analyzed.lock().unwrap() = Some(jpeg);
    }

    pub fn analyzed(&self) -> Option<Bytes> {
        self.analyzed.lock().unwrap().clone()
    }
}

impl Default for FrameHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a JPEG into one part of a `multipart/x-mixed-replace` stream.
pub fn as_jpeg_stream_item(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(
        &[
            "--frame\r\nContent-Type: image/jpeg\r\n\r\n".as_bytes(),
            data,
            "\r\n\r\n".as_bytes(),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stream_item_framing() {
        let item = as_jpeg_stream_item(&[0xff, 0xd8]);

        assert!(item.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(item.ends_with(&[0xff, 0xd8, b'\r', b'\n', b'\r', b'\n']));
    }

    #[test]
    fn test_latest_frame_is_replaced() {
        let hub = FrameHub::new();
        assert!(hub.latest().is_none());

        hub.publish(Bytes::from_static(b"first"));
        hub.publish(Bytes::from_static(b"second"));

        assert_eq!(hub.latest(), Some(Bytes::from_static(b"second")));
    }

    #[tokio::test]
    async fn test_subscribers_receive_stream_items() {
        let hub = FrameHub::new();
        let mut rx = hub.subscribe();

        hub.clone().publish(Bytes::from_static(b"jpeg"));

        let item = rx.recv().await.unwrap();
        assert_eq!(item, as_jpeg_stream_item(b"jpeg"));
    }
}
