use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cdp::CdpConnection;

/// JPEG quality for preview frames; latency matters more than fidelity.
const PREVIEW_QUALITY: u8 = 50;

/// In-process frame topic keyed by `client/test/session`. Consumers (MJPEG
/// façade, dashboards) subscribe; the pump publishes.
#[derive(Clone, Default)]
pub struct FrameTopic {
    inner: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl FrameTopic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: &str, frame: Vec<u8>) {
        let mut map = self.inner.lock().unwrap();
        let tx = map
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(4).0);
        // No receivers is fine; frames are fire-and-forget.
        let _ = tx.send(frame);
    }

    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<Vec<u8>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(key.to_string())
            .or_insert_with(|| broadcast::channel(4).0)
            .subscribe()
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }
}

/// Map the configured refresh rate (seconds) to the tick period. The sub-
/// second offsets keep the pump from beating against the 1s metrics ticker.
pub fn cadence(refresh_secs: u64) -> Duration {
    let ms = match refresh_secs {
        0 => 220,
        n => n * 1000 - 100,
    };
    Duration::from_millis(ms)
}

/// Where `latest.jpg` lands: shared memory when writable (cheap for
/// high-frequency rewrites), the session root otherwise.
pub fn latest_jpeg_target(session_root: &Path) -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir()
        && std::fs::write(shm.join(".rabbitize-probe"), b"").is_ok()
    {
        let _ = std::fs::remove_file(shm.join(".rabbitize-probe"));
        return shm.join("latest.jpg");
    }
    session_root.join("latest.jpg")
}

/// Live preview pump: periodic low-latency JPEG capture into `latest.jpg`
/// and the frame topic. Ticks are skipped while a capture is in flight.
pub struct PreviewPump {
    handle: JoinHandle<()>,
}

impl PreviewPump {
    pub fn spawn(
        conn: CdpConnection,
        topic: FrameTopic,
        topic_key: String,
        target: PathBuf,
        refresh_secs: u64,
    ) -> Self {
        let period = cadence(refresh_secs);
        debug!(period_ms = period.as_millis() as u64, target = %target.display(), "preview pump started");
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match capture_jpeg(&conn).await {
                    Ok(frame) => {
                        if let Err(e) = std::fs::write(&target, &frame) {
                            warn!(error = %e, "preview write failed");
                        }
                        topic.publish(&topic_key, frame);
                    }
                    Err(e) => trace!(error = %format!("{e:#}"), "preview capture skipped"),
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn capture_jpeg(conn: &CdpConnection) -> Result<Vec<u8>> {
    let result = conn
        .call(
            "Page.captureScreenshot",
            json!({"format": "jpeg", "quality": PREVIEW_QUALITY}),
        )
        .await?;
    let data = result["data"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("no screenshot data"))?;
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_table() {
        assert_eq!(cadence(0), Duration::from_millis(220));
        assert_eq!(cadence(1), Duration::from_millis(900));
        assert_eq!(cadence(2), Duration::from_millis(1900));
        assert_eq!(cadence(5), Duration::from_millis(4900));
        assert_eq!(cadence(10), Duration::from_millis(9900));
    }

    #[test]
    fn topic_delivers_to_subscribers() {
        let topic = FrameTopic::new();
        let mut rx = topic.subscribe("c/t/s");
        topic.publish("c/t/s", vec![1, 2, 3]);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let topic = FrameTopic::new();
        topic.publish("c/t/s", vec![9]);
    }
}
