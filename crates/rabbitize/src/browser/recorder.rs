use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use base64::Engine;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cdp::CdpConnection;

/// Recording frame size. Commands run at the page viewport; the screencast
/// is captured at up to this size for the session video.
const RECORD_WIDTH: u32 = 1920;
const RECORD_HEIGHT: u32 = 1080;

/// Session video recorder: `Page.startScreencast` JPEG frames piped into an
/// ffmpeg `image2pipe` encoder producing `session.webm`.
///
/// Chrome only emits frames on repaint, so frames are stamped with wallclock
/// time on the ffmpeg side; gaps between repaints become held frames, which
/// keeps clip cutting aligned with command timestamps.
pub struct Recorder {
    conn: CdpConnection,
    writer: JoinHandle<Result<()>>,
    output: PathBuf,
}

impl Recorder {
    pub async fn start(conn: CdpConnection, output: &Path) -> Result<Self> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut child = Command::new("ffmpeg")
            .args([
                "-y",
                "-loglevel",
                "error",
                "-use_wallclock_as_timestamps",
                "1",
                "-f",
                "image2pipe",
                "-c:v",
                "mjpeg",
                "-i",
                "-",
                "-c:v",
                "libvpx",
                "-quality",
                "realtime",
                "-cpu-used",
                "8",
                "-b:v",
                "2M",
                "-r",
                "30",
            ])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn ffmpeg for session recording")?;

        let mut stdin = child.stdin.take().context("No stdin on ffmpeg child")?;
        let mut frames = conn.subscribe("Page.screencastFrame");

        conn.call(
            "Page.startScreencast",
            json!({
                "format": "jpeg",
                "quality": 70,
                "maxWidth": RECORD_WIDTH,
                "maxHeight": RECORD_HEIGHT,
                "everyNthFrame": 1,
            }),
        )
        .await
        .context("Page.startScreencast failed")?;
        info!(output = %output.display(), "session recording started");

        let ack_conn = conn.clone();
        let writer = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(frame) = frames.recv().await {
                // Ack immediately so Chrome keeps the frames coming even if
                // the encoder write stalls briefly.
                if let Some(session_id) = frame.get("sessionId").and_then(|v| v.as_i64()) {
                    let _ = ack_conn
                        .call(
                            "Page.screencastFrameAck",
                            json!({"sessionId": session_id}),
                        )
                        .await;
                }

                let Some(data) = frame.get("data").and_then(|v| v.as_str()) else {
                    continue;
                };
                let jpeg = match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "undecodable screencast frame, skipping");
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(&jpeg).await {
                    warn!(error = %e, "ffmpeg stdin write failed, stopping recorder");
                    break;
                }
                count += 1;
            }

            drop(stdin); // EOF lets ffmpeg finalize the container
            let status = child
                .wait()
                .await
                .context("Failed to wait for recording ffmpeg")?;
            debug!(frames = count, status = %status, "recording encoder finished");
            Ok(())
        });

        Ok(Self {
            conn,
            writer,
            output: output.to_path_buf(),
        })
    }

    /// Stop the screencast and flush the encoder. Returns the output path.
    pub async fn stop(self) -> Result<PathBuf> {
        let _ = self.conn.call("Page.stopScreencast", json!({})).await;
        // Dropping the subscription ends the writer's frame stream.
        self.conn.unsubscribe("Page.screencastFrame");
        match self.writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "recording writer failed"),
            Err(e) => warn!(error = %e, "recording writer panicked"),
        }
        info!(output = %self.output.display(), "session recording stopped");
        Ok(self.output)
    }

    /// Abandon the recording without flushing (quick end while the browser
    /// is already gone).
    pub fn abort(self) {
        self.writer.abort();
    }
}
