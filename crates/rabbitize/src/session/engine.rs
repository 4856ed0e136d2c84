use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ids::SessionIds;
use super::status::StatusWriter;
use crate::artifacts::{ArtifactStore, dom};
use crate::browser::input;
use crate::browser::{Page, Recorder};
use crate::cdp::{CdpConnection, Chrome, PageTarget};
use crate::command::executor::{self, NAV_TIMEOUT, PointerState, StepCtx};
use crate::command::{Command, dispatch};
use crate::error::is_context_destroyed;
use crate::metrics::{CommandTag, MetricsHub};
use crate::overlay::Overlay;
use crate::preview::{FrameTopic, PreviewPump, latest_jpeg_target};
use crate::stability::{Settle, StabilityConfig, StabilityDetector};
use crate::video;

/// Engine-level configuration, resolved from the CLI before a session
/// starts.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub show_overlay: bool,
    pub process_video: bool,
    pub clip_segments: bool,
    /// Video recording; interactive sessions default it off unless the
    /// operator asked explicitly.
    pub record_video: bool,
    pub stability: StabilityConfig,
    pub stability_enabled: bool,
    pub preview_refresh_secs: u64,
    pub port: u16,
    /// Attach to a remote Chrome instead of launching one.
    pub chrome_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            show_overlay: true,
            process_video: false,
            clip_segments: false,
            record_video: true,
            stability: StabilityConfig::default(),
            stability_enabled: true,
            preview_refresh_secs: 0,
            port: 8080,
            chrome_url: None,
        }
    }
}

/// Linear lifecycle: queued -> running -> done | error, never backward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Only observed on queue items; the engine first sees a command when
    /// it is already being dispatched.
    #[allow(dead_code)]
    Queued,
    Running,
    Done,
    Error,
}

/// One executed command, as tracked in memory and flushed to
/// `commands.json`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub index: u64,
    pub verb: String,
    pub args: Value,
    pub queued_at: i64,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: CommandStatus,
    pub duration_ms: Option<u64>,
    pub output: Value,
}

/// The wire shape of `commands.json`: one entry per executed command.
pub fn commands_json(records: &[CommandRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|r| {
                json!({
                    "command": r.args,
                    "timestamp": r.started_at,
                    "endTimestamp": r.ended_at,
                    "duration": r.duration_ms,
                    "output": r.output,
                })
            })
            .collect(),
    )
}

/// Shared last-activity clock for the inactivity watchdog.
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last.lock().unwrap().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The session engine: owns one browser, serializes commands against it,
/// drives the visual feedback loop, and writes the artifact bundle per
/// step. All mutation happens from the queue consumer.
pub struct SessionEngine {
    ids: SessionIds,
    config: EngineConfig,
    store: ArtifactStore,
    status: StatusWriter,

    chrome: Option<Chrome>,
    target: Option<PageTarget>,
    conn: Option<CdpConnection>,
    page: Option<Page>,
    overlay: Option<Overlay>,
    recorder: Option<Recorder>,

    stability: StabilityDetector,
    metrics: Arc<MetricsHub>,
    metrics_ticker: Option<JoinHandle<()>>,
    preview: Option<PreviewPump>,
    frame_navs: Option<mpsc::UnboundedReceiver<Value>>,

    pointer: PointerState,
    armed_uploads: Arc<Mutex<Option<Vec<String>>>>,

    records: Vec<CommandRecord>,
    command_counter: u64,
    initial_url: String,
    initialized: bool,
    failed: bool,
    fully_complete: bool,

    activity: ActivityTracker,
    frames: FrameTopic,
}

impl SessionEngine {
    pub fn new(
        ids: SessionIds,
        initial_url: &str,
        config: EngineConfig,
        frames: FrameTopic,
        activity: ActivityTracker,
        total_commands: Option<u64>,
    ) -> Self {
        let store = ArtifactStore::new(&ids.client_id, &ids.test_id, &ids.session_id);
        let mut status = StatusWriter::new(
            store.clone(),
            &ids,
            initial_url,
            config.port,
            config.process_video,
        );
        status.set_total_commands(total_commands);
        let stability = StabilityDetector::new(config.stability, config.stability_enabled);
        Self {
            ids,
            store,
            status,
            stability,
            config,
            chrome: None,
            target: None,
            conn: None,
            page: None,
            overlay: None,
            recorder: None,
            metrics: MetricsHub::new(),
            metrics_ticker: None,
            preview: None,
            frame_navs: None,
            pointer: PointerState::default(),
            armed_uploads: Arc::new(Mutex::new(None)),
            records: Vec::new(),
            command_counter: 0,
            initial_url: initial_url.to_string(),
            initialized: false,
            failed: false,
            fully_complete: false,
            activity,
            frames,
        }
    }

    pub fn ids(&self) -> &SessionIds {
        &self.ids
    }

    pub fn command_counter(&self) -> u64 {
        self.command_counter
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Record an externally-driven phase transition (e.g. the inactivity
    /// watchdog announcing why the session is about to end).
    pub fn set_phase(&mut self, phase: &str) {
        self.status.set_phase(phase);
    }

    /// Bring up the whole stack: browser, page, overlays, recorder, tickers,
    /// initial navigation and initial captures. Idempotent per session.
    pub async fn initialize(&mut self) -> Result<Value> {
        if self.initialized {
            return Ok(json!({"success": true, "sessionId": self.ids.session_id, "alreadyInitialized": true}));
        }

        info!(session = %self.ids.key(), url = %self.initial_url, "initializing session");
        self.store.ensure_tree()?;
        self.status.set_phase("initializing");

        let chrome = match &self.config.chrome_url {
            Some(url) => Chrome::attach(url).await?,
            None => Chrome::launch(&self.ids.session_id).await?,
        };
        let target = chrome.open_page().await?;
        let conn = target.conn.clone();
        let page = Page::attach(conn.clone()).await?;
        self.chrome = Some(chrome);
        self.target = Some(target);

        // Recording starts before navigation so the load is on film.
        // Interactive sessions skip it unless explicitly requested upstream.
        if self.config.record_video {
            match Recorder::start(conn.clone(), &self.store.session_webm()).await {
                Ok(recorder) => self.recorder = Some(recorder),
                Err(e) => warn!(error = %format!("{e:#}"), "recording unavailable"),
            }
        }

        let overlay = Overlay::new(conn.clone(), self.config.show_overlay, self.ids.interactive());
        overlay.install().await?;

        // Warp the pointer to viewport center before the first command.
        let (cx, cy) = page.center();
        input::mouse_move(&conn, cx, cy).await?;
        overlay.move_cursor(cx, cy).await;
        self.pointer.x = cx;
        self.pointer.y = cy;

        self.frame_navs = Some(page.frame_navigations());
        self.spawn_chooser_watcher(&page).await?;

        // Initial navigation: a timeout is non-fatal, the session stays up.
        let url = self.initial_url.clone();
        let mut nav_timeout = false;
        self.conn = Some(conn.clone());
        self.page = Some(page);
        self.overlay = Some(overlay);

        {
            let mut ctx = self.step_ctx(0);
            match ctx.page.goto(&url, NAV_TIMEOUT).await? {
                crate::browser::NavOutcome::Loaded => {
                    ctx.overlay.ensure_installed().await;
                }
                crate::browser::NavOutcome::TimedOut { reason } => {
                    warn!(url = %url, reason, "initial navigation timed out");
                    executor::render_timeout_page(&mut ctx, &url, NAV_TIMEOUT.as_secs()).await;
                    nav_timeout = true;
                }
            }
        }

        // Initial captures are best-effort.
        match dom::capture_dom_coords(&conn).await {
            Ok(coords) => {
                let path = self.store.dom_coords_initial();
                if let Err(e) = self.store.write_json_atomic(&path, &coords) {
                    warn!(error = %format!("{e:#}"), "initial DOM coords write failed");
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "initial DOM capture failed"),
        }
        if let Some(page) = &self.page
            && let Ok(jpeg) = page.screenshot_jpeg(35).await
        {
            self.store
                .write_soft(&self.store.root().join("screenshots").join("start.jpg"), &jpeg);
            self.store.write_soft(&self.store.latest_jpg(), &jpeg);
        }

        self.metrics_ticker = Some(self.metrics.spawn_ticker());
        self.preview = Some(PreviewPump::spawn(
            conn,
            self.frames.clone(),
            self.ids.key(),
            latest_jpeg_target(self.store.root()),
            self.config.preview_refresh_secs,
        ));

        self.initialized = true;
        self.activity.touch();
        self.status.set_phase("ready");
        info!(session = %self.ids.key(), "session initialized");

        Ok(json!({
            "success": !nav_timeout,
            "sessionId": self.ids.session_id,
            "isNavigationTimeout": nav_timeout,
        }))
    }

    /// Watch for file chooser dialogs for the whole session. Armed files are
    /// single-shot: the first chooser consumes them.
    async fn spawn_chooser_watcher(&self, page: &Page) -> Result<()> {
        let mut choosers = page.intercept_file_choosers().await?;
        let conn = page.conn().clone();
        let armed = self.armed_uploads.clone();
        tokio::spawn(async move {
            while let Some(event) = choosers.recv().await {
                let files = armed.lock().unwrap().take();
                match files {
                    Some(files) => {
                        let Some(node_id) = event.get("backendNodeId").and_then(|v| v.as_i64())
                        else {
                            warn!("file chooser event without backendNodeId");
                            continue;
                        };
                        match conn
                            .call(
                                "DOM.setFileInputFiles",
                                json!({"files": files, "backendNodeId": node_id}),
                            )
                            .await
                        {
                            Ok(_) => info!(count = files.len(), "file chooser satisfied"),
                            Err(e) => {
                                warn!(error = %format!("{e:#}"), "file chooser submit failed");
                            }
                        }
                    }
                    None => warn!("file chooser opened with no armed files, declining"),
                }
            }
        });
        Ok(())
    }

    fn step_ctx(&mut self, index: u64) -> StepCtx<'_> {
        StepCtx {
            index,
            page: self.page.as_mut().expect("page initialized"),
            overlay: self.overlay.as_ref().expect("overlay initialized"),
            store: &self.store,
            pointer: &mut self.pointer,
            armed_uploads: &self.armed_uploads,
        }
    }

    /// Drain pending main-frame navigation events: reinstall the overlay and
    /// re-enable stability detection.
    async fn absorb_navigations(&mut self) {
        let mut navigated = false;
        if let Some(rx) = self.frame_navs.as_mut() {
            while let Ok(event) = rx.try_recv() {
                let is_main = event["frame"]["parentId"].is_null();
                if is_main {
                    navigated = true;
                }
            }
        }
        if navigated {
            debug!("main-frame navigation absorbed");
            self.stability.note_navigation();
            if let Some(overlay) = &self.overlay {
                overlay.ensure_installed().await;
            }
        }
    }

    /// The per-command step loop. Always returns an output object; hard
    /// failures set `failed` and the queue stops feeding us.
    pub async fn execute(&mut self, raw: Vec<Value>) -> Value {
        if !self.initialized || self.fully_complete {
            return json!({"success": false, "error": "Session not initialized"});
        }
        if self.failed {
            return json!({
                "success": false,
                "error": "Session is in a failed state; end it and start a new one",
            });
        }

        self.activity.touch();

        let cmd = match Command::parse(&raw) {
            Ok(cmd) => cmd,
            Err(e) => {
                // Unknown or malformed commands never mutate state.
                return json!({"success": false, "error": format!("{e}")});
            }
        };

        let index = self.command_counter;
        let verb = cmd.verb().to_string();
        let raw_value = Value::Array(raw);
        let started_at = chrono::Utc::now().timestamp_millis();
        info!(index, verb = %verb, "executing command");
        let mut record = CommandRecord {
            index,
            verb: verb.clone(),
            args: raw_value.clone(),
            queued_at: started_at,
            started_at,
            ended_at: None,
            status: CommandStatus::Running,
            duration_ms: None,
            output: Value::Null,
        };

        self.status.command_running(index, &raw_value);
        self.metrics.set_current(CommandTag {
            text: verb.clone(),
            index,
            raw: raw_value.clone(),
        });

        // Pre-state: overlay feedback, red corner, pre screenshot, metrics.
        let pattern = {
            let overlay = self.overlay.as_mut().expect("overlay initialized");
            overlay.record_pattern(&verb);
            overlay.patterns().clone()
        };
        if let Err(e) = self
            .store
            .write_json_atomic(&self.store.color_patterns(), &pattern)
        {
            warn!(error = %format!("{e:#}"), "color-patterns.json write failed");
        }

        {
            let ctx = self.step_ctx(index);
            ctx.overlay.show_command(&raw_value.to_string()).await;
            ctx.overlay.paint_red().await;
            if let Ok(jpeg) = ctx.page.screenshot_jpeg(35).await {
                ctx.store
                    .write_soft(&ctx.store.pre_screenshot(index, &verb), &jpeg);
                ctx.store.write_soft(&ctx.store.latest_jpg(), &jpeg);
            }
        }
        self.metrics.sample_now();

        // Dispatch with the verb's pattern on the corner.
        if let Some(overlay) = &self.overlay {
            overlay.paint_pattern(&verb).await;
        }
        let dispatched = {
            let mut ctx = self.step_ctx(index);
            dispatch(&mut ctx, &cmd).await
        };
        if let Some(overlay) = &self.overlay {
            overlay.paint_black().await;
        }

        let output = match dispatched {
            Ok(output) => output,
            Err(e) if is_context_destroyed(&e) => {
                // The page navigated out from under the command. Soft
                // success; the counter does not advance and no artifacts are
                // written for this index.
                info!(index, "context destroyed mid-command, treating as navigation");
                self.absorb_navigations().await;
                return json!({"success": true, "contextChanged": true, "commandIndex": index});
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(index, verb = %verb, error = %message, "command dispatch failed");
                self.failed = true;
                self.status.record_error(&message);
                self.status.set_phase("command_failed");
                let ended_at = chrono::Utc::now().timestamp_millis();
                record.ended_at = Some(ended_at);
                record.status = CommandStatus::Error;
                record.duration_ms = Some((ended_at - started_at).max(0) as u64);
                record.output = json!({"error": message});
                self.records.push(record);
                self.flush_commands();
                return json!({
                    "success": false,
                    "error": message,
                    "commandIndex": index,
                });
            }
        };

        // Explicit navigations re-enable stability right away; navigations
        // triggered by clicks are picked up from the event stream.
        if matches!(cmd, Command::Navigate { .. } | Command::Back | Command::Forward) {
            self.stability.note_navigation();
        }
        self.absorb_navigations().await;

        // Stability: soft by contract, never fails the command.
        match self.wait_stability().await {
            Ok(Settle::TimedOut) => debug!(index, "stability timed out (soft)"),
            Ok(_) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "stability polling failed"),
        }

        // Post-state bundle.
        self.capture_post_state(index, &verb, &cmd).await;
        self.metrics.sample_now();

        let ended_at = chrono::Utc::now().timestamp_millis();
        record.ended_at = Some(ended_at);
        record.status = CommandStatus::Done;
        record.duration_ms = Some((ended_at - started_at).max(0) as u64);
        record.output = output.clone();
        self.records.push(record);
        self.flush_commands();
        self.store
            .write_soft(&self.store.last_command_idx(), index.to_string().as_bytes());

        self.command_counter += 1;
        self.status.command_done(self.command_counter);
        output
    }

    async fn wait_stability(&mut self) -> Result<Settle> {
        match &self.page {
            Some(page) => self.stability.wait_for_stability(page).await,
            None => Ok(Settle::Disabled),
        }
    }

    /// Steps 8-11 of the loop: raw PNG, post screenshot, DOM captures,
    /// derived images. All artifact failures are warn-and-continue.
    async fn capture_post_state(&mut self, index: u64, verb: &str, cmd: &Command) {
        let Some(page) = self.page.as_ref() else { return };
        let Some(conn) = self.conn.as_ref() else { return };

        let png = match page.screenshot_png().await {
            Ok(png) => Some(png),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "post-stability screenshot failed");
                None
            }
        };

        match dom::capture_dom_coords(conn).await {
            Ok(coords) => {
                let bytes = serde_json::to_vec_pretty(&coords).unwrap_or_default();
                self.store.write_soft(&self.store.dom_coords(index), &bytes);
                self.store.write_soft(&self.store.latest_json(), &bytes);
            }
            Err(e) => warn!(error = %format!("{e:#}"), "DOM coords capture failed"),
        }

        match dom::capture_markdown(conn).await {
            Ok(markdown) => {
                self.store
                    .write_soft(&self.store.dom_snapshot(index), markdown.as_bytes());
                self.store
                    .write_soft(&self.store.latest_md(), markdown.as_bytes());
            }
            Err(e) => warn!(error = %format!("{e:#}"), "markdown capture failed"),
        }

        if let Some(png) = png {
            let mouse = (self.pointer.x, self.pointer.y);
            if let Err(e) =
                self.store
                    .process_step_png(&png, index, mouse, cmd.is_click_family())
            {
                warn!(error = %format!("{e:#}"), "step image processing failed");
            }
            // Post screenshot shares the canonical frame.
            if let Err(e) = std::fs::copy(
                self.store.canonical(index),
                self.store.post_screenshot(index, verb),
            ) {
                warn!(error = %e, "post screenshot copy failed");
            }
        }
    }

    fn flush_commands(&self) {
        let value = commands_json(&self.records);
        if let Err(e) = self
            .store
            .write_json_atomic(&self.store.commands_json(), &value)
        {
            warn!(error = %format!("{e:#}"), "commands.json write failed");
        }
    }

    /// Full teardown with post-processing. `quick` skips the video pipeline.
    pub async fn end(&mut self, quick: bool) -> Result<Value> {
        info!(session = %self.ids.key(), quick, "ending session");
        self.status.set_phase("ending_session");

        self.stop_workers();

        // Stop the recorder while the connection is still alive, then tear
        // the browser down.
        if let Some(recorder) = self.recorder.take() {
            if quick {
                recorder.abort();
            } else if let Err(e) = recorder.stop().await {
                warn!(error = %format!("{e:#}"), "recorder stop failed");
            }
        }
        self.close_browser().await;

        if !quick && self.config.process_video && self.store.session_webm().is_file() {
            self.run_video_pipeline().await;
        }

        self.status.set_phase("uploading_files");
        self.flush_commands();
        if let Err(e) = self
            .store
            .write_json_atomic(&self.store.metrics_json(), &self.metrics.samples())
        {
            warn!(error = %format!("{e:#}"), "metrics.json write failed");
        }
        if let Some(overlay) = &self.overlay {
            let _ = self
                .store
                .write_json_atomic(&self.store.color_patterns(), overlay.patterns());
        }

        let executed = self.records.len() as u64;
        let metadata = json!({
            "clientId": self.ids.client_id,
            "testId": self.ids.test_id,
            "sessionId": self.ids.session_id,
            "status": "finished",
            "initialUrl": self.initial_url,
            "startTime": self.status.state().start_time,
            "endTime": chrono::Utc::now().timestamp_millis(),
            "commandsExecuted": executed,
            "videoProcessing": self.config.process_video && !quick,
        });
        self.store
            .write_json_atomic(&self.store.session_metadata(), &metadata)
            .context("session-metadata.json write failed")?;

        let summary = json!({
            "clientId": self.ids.client_id,
            "testId": self.ids.test_id,
            "sessionId": self.ids.session_id,
            "commandsExecuted": executed,
            "status": "finished",
        });
        // Single machine-readable line for external orchestrators; stdout is
        // reserved for exactly this.
        println!("EXECUTION_SUMMARY={summary}");

        self.fully_complete = true;
        self.page = None;
        self.overlay = None;
        self.frames.remove(&self.ids.key());
        self.status.finish("complete");
        info!(session = %self.ids.key(), executed, "session complete");
        Ok(summary)
    }

    /// Minimal teardown: release the browser and timers, no post-processing.
    pub async fn quick_end(&mut self) -> Result<Value> {
        self.stop_workers();
        if let Some(recorder) = self.recorder.take() {
            recorder.abort();
        }
        self.close_browser().await;
        self.page = None;
        self.overlay = None;
        self.frames.remove(&self.ids.key());
        self.status.finish("complete");
        Ok(json!({"success": true}))
    }

    fn stop_workers(&mut self) {
        self.stability.stop_handle().stop();
        if let Some(ticker) = self.metrics_ticker.take() {
            ticker.abort();
        }
        if let Some(preview) = self.preview.take() {
            preview.stop();
        }
    }

    async fn close_browser(&mut self) {
        if let Some(target) = self.target.take()
            && let Err(e) = target.close().await
        {
            warn!(error = %format!("{e:#}"), "page close failed");
        }
        self.conn = None;
        if let Some(mut chrome) = self.chrome.take() {
            chrome.kill();
        }
    }

    async fn run_video_pipeline(&mut self) {
        let store = self.store.clone();
        let records = self.records.clone();
        let clip_segments = self.config.clip_segments;
        let video_start_ms = self.status.state().start_time;
        let status = &mut self.status;
        if let Err(e) = video::run_pipeline(&store, &records, clip_segments, video_start_ms, |phase| {
            status.set_phase(phase)
        })
        .await
        {
            // Post-processing failure still leaves the session complete with
            // whatever was produced.
            warn!(error = %format!("{e:#}"), "video post-processing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, verb: &str) -> CommandRecord {
        CommandRecord {
            index,
            verb: verb.to_string(),
            args: json!([verb]),
            queued_at: 1000,
            started_at: 1000 + index as i64,
            ended_at: Some(2000 + index as i64),
            status: CommandStatus::Done,
            duration_ms: Some(1000),
            output: json!({"success": true}),
        }
    }

    #[test]
    fn commands_json_shape() {
        let records = vec![record(0, ":click"), record(1, ":wait")];
        let value = commands_json(&records);
        let arr = value.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["command"], json!([":click"]));
        assert_eq!(arr[1]["timestamp"], json!(1001));
        assert_eq!(arr[1]["duration"], json!(1000));
    }

    #[test]
    fn command_indices_are_gapless_and_increasing() {
        let records: Vec<_> = (0..5).map(|i| record(i, ":click")).collect();
        for (expected, r) in records.iter().enumerate() {
            assert_eq!(r.index, expected as u64);
        }
    }

    #[test]
    fn activity_tracker_resets_on_touch() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(tracker.idle_for().as_millis() >= 5);
        tracker.touch();
        assert!(tracker.idle_for().as_millis() < 5);
    }
}
