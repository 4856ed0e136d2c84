use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cdp::{CdpConnection, ClipRect};

/// Default viewport for command execution. Recording frames are captured at
/// 1920x1080 regardless (see the recorder).
pub const DEFAULT_VIEWPORT: (u32, u32) = (1280, 1024);

/// How a navigation attempt ended.
#[derive(Debug)]
pub enum NavOutcome {
    Loaded,
    /// Deadline hit, or the network layer failed outright (unreachable
    /// host). Both are soft: the caller renders the timeout page.
    TimedOut { reason: String },
}

/// Page-level driver over a per-target CDP connection: navigation with a
/// deadline, history, screenshots, PDF, viewport, downloads, file chooser.
pub struct Page {
    conn: CdpConnection,
    width: u32,
    height: u32,
}

impl Page {
    pub async fn attach(conn: CdpConnection) -> Result<Self> {
        conn.call("Page.enable", json!({})).await?;
        conn.call("Runtime.enable", json!({})).await?;
        conn.call("DOM.enable", json!({})).await?;
        let page = Self {
            conn,
            width: DEFAULT_VIEWPORT.0,
            height: DEFAULT_VIEWPORT.1,
        };
        page.apply_viewport().await?;
        Ok(page)
    }

    pub fn conn(&self) -> &CdpConnection {
        &self.conn
    }

    pub fn center(&self) -> (f64, f64) {
        (self.width as f64 / 2.0, self.height as f64 / 2.0)
    }

    async fn apply_viewport(&self) -> Result<()> {
        self.conn
            .call(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": self.width,
                    "height": self.height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            )
            .await
            .context("Failed to set device metrics")?;
        Ok(())
    }

    pub async fn set_viewport(&mut self, width: u32, height: u32) -> Result<()> {
        self.width = width.max(1);
        self.height = height.max(1);
        self.apply_viewport().await
    }

    /// Adjust the viewport by signed deltas, clamped to sane minimums.
    pub async fn adjust_viewport(&mut self, dw: i32, dh: i32) -> Result<(u32, u32)> {
        let w = (self.width as i64 + dw as i64).clamp(100, 7680) as u32;
        let h = (self.height as i64 + dh as i64).clamp(100, 4320) as u32;
        self.set_viewport(w, h).await?;
        Ok((w, h))
    }

    /// Navigate with `domcontentloaded` semantics and a hard deadline.
    ///
    /// An immediate network-level failure (`errorText` on the navigate
    /// response) is reported through the same `TimedOut` outcome — both end
    /// with the caller rendering the local timeout page.
    pub async fn goto(&self, url: &str, deadline: Duration) -> Result<NavOutcome> {
        debug!(url, "navigating");
        let mut dom_ready = self.conn.subscribe("Page.domContentEventFired");

        // The navigate call itself can hang on a blackholed host; its
        // deadline expiring is a navigation timeout, not a CDP failure.
        let result = match tokio::time::timeout(
            deadline,
            self.conn.call("Page.navigate", json!({"url": url})),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                self.conn.unsubscribe("Page.domContentEventFired");
                return Ok(NavOutcome::TimedOut {
                    reason: format!("navigate call exceeded {deadline:?}"),
                });
            }
        };

        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str())
            && !error_text.is_empty()
        {
            warn!(url, error_text, "navigation failed at network level");
            self.conn.unsubscribe("Page.domContentEventFired");
            return Ok(NavOutcome::TimedOut {
                reason: error_text.to_string(),
            });
        }

        let outcome = match tokio::time::timeout(deadline, dom_ready.recv()).await {
            Ok(Some(_)) => NavOutcome::Loaded,
            Ok(None) => bail!("Connection closed during navigation"),
            Err(_) => NavOutcome::TimedOut {
                reason: format!("no domcontentloaded within {deadline:?}"),
            },
        };
        self.conn.unsubscribe("Page.domContentEventFired");
        debug!(url, outcome = ?outcome, "navigation settled");
        Ok(outcome)
    }

    /// History step: -1 for back, +1 for forward. No-op at the history edge.
    pub async fn history_step(&self, offset: i64) -> Result<bool> {
        let history = self
            .conn
            .call("Page.getNavigationHistory", json!({}))
            .await?;
        let current = history["currentIndex"].as_i64().unwrap_or(0);
        let entries = history["entries"].as_array().cloned().unwrap_or_default();
        let target = current + offset;
        if target < 0 || target as usize >= entries.len() {
            return Ok(false);
        }
        let entry_id = entries[target as usize]["id"]
            .as_i64()
            .context("history entry without id")?;
        self.conn
            .call(
                "Page.navigateToHistoryEntry",
                json!({"entryId": entry_id}),
            )
            .await?;
        Ok(true)
    }

    /// Viewport screenshot as JPEG at the given quality.
    pub async fn screenshot_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        self.capture(json!({"format": "jpeg", "quality": quality}))
            .await
    }

    /// Viewport screenshot as lossless PNG (artifact post-processing input).
    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        self.capture(json!({"format": "png"})).await
    }

    /// Clipped screenshot (stability detector, rabbit-eyes crops).
    pub async fn screenshot_clip_jpeg(&self, clip: &ClipRect, quality: u8) -> Result<Vec<u8>> {
        self.capture(json!({
            "format": "jpeg",
            "quality": quality,
            "clip": {"x": clip.x, "y": clip.y, "width": clip.w, "height": clip.h, "scale": 1},
        }))
        .await
    }

    async fn capture(&self, mut params: Value) -> Result<Vec<u8>> {
        params["captureBeyondViewport"] = json!(false);
        let result = self
            .conn
            .call("Page.captureScreenshot", params)
            .await
            .context("Failed to capture screenshot")?;
        let b64_data = result["data"]
            .as_str()
            .context("No screenshot data in response")?;
        base64::engine::general_purpose::STANDARD
            .decode(b64_data)
            .context("Failed to decode base64 screenshot")
    }

    /// Render the page to PDF. `a4` selects A4 paper, otherwise Letter.
    /// Margins are 20 px at 96 dpi; backgrounds always print.
    pub async fn print_to_pdf(&self, a4: bool, landscape: bool) -> Result<Vec<u8>> {
        let (paper_w, paper_h) = if a4 { (8.27, 11.69) } else { (8.5, 11.0) };
        let margin = 20.0 / 96.0;
        let result = self
            .conn
            .call(
                "Page.printToPDF",
                json!({
                    "landscape": landscape,
                    "printBackground": true,
                    "paperWidth": paper_w,
                    "paperHeight": paper_h,
                    "marginTop": margin,
                    "marginBottom": margin,
                    "marginLeft": margin,
                    "marginRight": margin,
                }),
            )
            .await
            .context("Page.printToPDF failed")?;
        let b64_data = result["data"].as_str().context("No PDF data in response")?;
        base64::engine::general_purpose::STANDARD
            .decode(b64_data)
            .context("Failed to decode base64 PDF")
    }

    /// Open the print dialog and leave saving to the operator.
    pub async fn open_print_dialog(&self) -> Result<()> {
        self.conn.eval("window.print()").await?;
        Ok(())
    }

    /// Route all subsequent downloads into `dir`.
    pub async fn set_download_dir(&self, dir: &Path) -> Result<()> {
        self.conn
            .call(
                "Browser.setDownloadBehavior",
                json!({
                    "behavior": "allow",
                    "downloadPath": dir.to_string_lossy(),
                    "eventsEnabled": true,
                }),
            )
            .await
            .context("Failed to set download behavior")?;
        Ok(())
    }

    /// Intercept file chooser dialogs and return the event stream. The
    /// subscription lives for the whole session; the chooser watcher decides
    /// per event whether files are armed.
    pub async fn intercept_file_choosers(&self) -> Result<mpsc::UnboundedReceiver<Value>> {
        let rx = self.conn.subscribe("Page.fileChooserOpened");
        self.conn
            .call(
                "Page.setInterceptFileChooserDialog",
                json!({"enabled": true}),
            )
            .await
            .context("Failed to intercept file choosers")?;
        Ok(rx)
    }

    /// Main-frame navigation stream (`Page.frameNavigated` filtered by the
    /// caller on `parentId` absence).
    pub fn frame_navigations(&self) -> mpsc::UnboundedReceiver<Value> {
        self.conn.subscribe("Page.frameNavigated")
    }
}
