use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::extract;
use super::parse::Command;
use crate::artifacts::ArtifactStore;
use crate::browser::input::{self, MouseButton};
use crate::browser::{NavOutcome, Page};
use crate::cdp::ClipRect;
use crate::llm::RabbitEyes;
use crate::overlay::Overlay;

/// Navigation ceiling for `:navigate` / `:url` and initial loads.
pub const NAV_TIMEOUT: Duration = Duration::from_secs(60);

/// Cursor glide: 30 incremental mouse moves ~1ms apart while the sprite
/// animates over 300ms, so recordings show a believable path.
const GLIDE_STEPS: u32 = 30;
const GLIDE_STEP_DELAY: Duration = Duration::from_millis(1);

/// Click choreography: press animation dwell, then the real click, then
/// enough padding for the ripple to live on the recording.
const CLICK_PRESS_DWELL: Duration = Duration::from_millis(150);
const CLICK_TOTAL: Duration = Duration::from_millis(850);

/// Wheel cadence. Up keeps the long-standing slow cadence; down is brisk.
const SCROLL_DELAY_DOWN: Duration = Duration::from_millis(200);
const SCROLL_DELAY_UP: Duration = Duration::from_millis(2050);

/// Local page rendered when a navigation blows its ceiling.
const TIMEOUT_PAGE_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Navigation timed out</title>
<style>
  body { font-family: sans-serif; background: #1a1a2e; color: #eee;
         display: flex; align-items: center; justify-content: center; height: 100vh; }
  .box { text-align: center; }
  .url { color: #ff6b6b; word-break: break-all; }
</style></head>
<body><div class="box">
  <h1>Navigation timed out</h1>
  <p class="url" id="url"></p>
  <p id="after"></p>
  <script>
    var q = new URLSearchParams(window.location.search);
    document.getElementById('url').textContent = q.get('url') || '';
    document.getElementById('after').textContent = 'gave up after ' + (q.get('timeout') || '');
  </script>
</div></body></html>
"#;

/// Pointer and button state carried across commands.
#[derive(Debug, Default)]
pub struct PointerState {
    pub x: f64,
    pub y: f64,
    pub is_mouse_down: bool,
    pub is_right_mouse_down: bool,
    pub is_middle_mouse_down: bool,
    pub is_dragging: bool,
}

impl PointerState {
    fn held(&mut self, button: MouseButton) -> &mut bool {
        match button {
            MouseButton::Left => &mut self.is_mouse_down,
            MouseButton::Right => &mut self.is_right_mouse_down,
            MouseButton::Middle => &mut self.is_middle_mouse_down,
        }
    }
}

/// Everything a command handler may touch, borrowed from the engine for the
/// duration of one step.
pub struct StepCtx<'a> {
    pub index: u64,
    pub page: &'a mut Page,
    pub overlay: &'a Overlay,
    pub store: &'a ArtifactStore,
    pub pointer: &'a mut PointerState,
    /// Files armed for the next file chooser; the chooser watcher clears it.
    pub armed_uploads: &'a Mutex<Option<Vec<String>>>,
}

/// Dispatch one parsed command. Soft failures (navigation timeout, missing
/// hold state) come back as `Ok` outputs with `success:false` or a warning;
/// a returned `Err` is either context-destroyed (the engine inspects it) or
/// a hard dispatch failure.
pub async fn dispatch(ctx: &mut StepCtx<'_>, cmd: &Command) -> Result<Value> {
    match cmd {
        Command::Navigate { url } => navigate(ctx, url).await,
        Command::MoveMouse { x, y } => {
            glide_to(ctx, *x, *y).await?;
            Ok(json!({"success": true, "x": x, "y": y}))
        }
        Command::Click { button } => click(ctx, *button).await,
        Command::ClickHold { button } => hold(ctx, *button).await,
        Command::ClickRelease { button } => release(ctx, *button).await,
        Command::Drag { from, to } => drag(ctx, *from, *to).await,
        Command::StartDrag { x, y } => start_drag(ctx, *x, *y).await,
        Command::EndDrag { x, y } => end_drag(ctx, *x, *y).await,
        Command::Scroll { up, count } => scroll(ctx, *up, *count).await,
        Command::Type { text } => {
            input::insert_text(ctx.page.conn(), text).await?;
            Ok(json!({"success": true, "typed": text.chars().count()}))
        }
        Command::Keypress { spec } => keypress(ctx, spec).await,
        Command::Wait { seconds } => wait(ctx, *seconds).await,
        Command::Back => history(ctx, -1).await,
        Command::Forward => history(ctx, 1).await,
        Command::Width { delta } => {
            let (w, h) = ctx.page.adjust_viewport(*delta, 0).await?;
            Ok(json!({"success": true, "viewport": {"width": w, "height": h}}))
        }
        Command::Height { delta } => {
            let (w, h) = ctx.page.adjust_viewport(0, *delta).await?;
            Ok(json!({"success": true, "viewport": {"width": w, "height": h}}))
        }
        Command::PrintPdf { dialog, a4, landscape } => print_pdf(ctx, *dialog, *a4, *landscape).await,
        Command::SetDownloadPath { path } => set_download_path(ctx, path).await,
        Command::SetUploadFile { paths } => set_upload_file(ctx, paths).await,
        Command::Extract { rect } => extract_cmd(ctx, *rect).await,
        Command::ExtractPage => {
            let markdown = crate::artifacts::dom::capture_markdown(ctx.page.conn()).await?;
            Ok(json!({"success": true, "markdown": markdown}))
        }
        Command::RabbitEyes { prompt, rect } => rabbit_eyes(ctx, prompt, *rect).await,
    }
}

// ---------------------------------------------------------------------------
// Pointer
// ---------------------------------------------------------------------------

/// Animate the sprite (300ms CSS) while walking the real mouse over in 30
/// small hops, then commit the new position.
async fn glide_to(ctx: &mut StepCtx<'_>, x: f64, y: f64) -> Result<()> {
    ctx.overlay.move_cursor(x, y).await;
    let (sx, sy) = (ctx.pointer.x, ctx.pointer.y);
    for i in 1..=GLIDE_STEPS {
        let t = i as f64 / GLIDE_STEPS as f64;
        input::mouse_move(ctx.page.conn(), sx + (x - sx) * t, sy + (y - sy) * t).await?;
        tokio::time::sleep(GLIDE_STEP_DELAY).await;
    }
    ctx.pointer.x = x;
    ctx.pointer.y = y;
    Ok(())
}

async fn click(ctx: &mut StepCtx<'_>, button: MouseButton) -> Result<Value> {
    let t0 = Instant::now();
    let (x, y) = (ctx.pointer.x, ctx.pointer.y);

    ctx.overlay.press(button.as_str()).await;
    tokio::time::sleep(CLICK_PRESS_DWELL).await;
    input::mouse_click(ctx.page.conn(), x, y, button).await?;
    ctx.overlay.ripple(x, y).await;
    ctx.overlay.release().await;

    if let Some(pad) = CLICK_TOTAL.checked_sub(t0.elapsed()) {
        tokio::time::sleep(pad).await;
    }
    Ok(json!({"success": true, "x": x, "y": y, "button": button.as_str()}))
}

async fn hold(ctx: &mut StepCtx<'_>, button: MouseButton) -> Result<Value> {
    let (x, y) = (ctx.pointer.x, ctx.pointer.y);
    ctx.overlay.press(button.as_str()).await;
    input::mouse_down(ctx.page.conn(), x, y, button).await?;
    *ctx.pointer.held(button) = true;
    Ok(json!({"success": true, "held": button.as_str()}))
}

async fn release(ctx: &mut StepCtx<'_>, button: MouseButton) -> Result<Value> {
    if !*ctx.pointer.held(button) {
        warn!(button = button.as_str(), "release without matching hold");
        return Ok(json!({
            "success": true,
            "warning": format!("{} release without matching hold", button.as_str()),
        }));
    }
    let (x, y) = (ctx.pointer.x, ctx.pointer.y);
    input::mouse_up(ctx.page.conn(), x, y, button).await?;
    *ctx.pointer.held(button) = false;
    ctx.overlay.release().await;
    Ok(json!({"success": true, "released": button.as_str()}))
}

async fn drag(ctx: &mut StepCtx<'_>, from: (f64, f64), to: (f64, f64)) -> Result<Value> {
    glide_to(ctx, from.0, from.1).await?;
    input::mouse_down(ctx.page.conn(), from.0, from.1, MouseButton::Left).await?;
    ctx.overlay.drag_start().await;
    glide_to(ctx, to.0, to.1).await?;
    input::mouse_up(ctx.page.conn(), to.0, to.1, MouseButton::Left).await?;
    ctx.overlay.drag_end().await;
    Ok(json!({"success": true, "from": [from.0, from.1], "to": [to.0, to.1]}))
}

async fn start_drag(ctx: &mut StepCtx<'_>, x: f64, y: f64) -> Result<Value> {
    glide_to(ctx, x, y).await?;
    input::mouse_down(ctx.page.conn(), x, y, MouseButton::Left).await?;
    ctx.pointer.is_dragging = true;
    ctx.overlay.drag_start().await;
    Ok(json!({"success": true, "dragging": true}))
}

async fn end_drag(ctx: &mut StepCtx<'_>, x: f64, y: f64) -> Result<Value> {
    if !ctx.pointer.is_dragging {
        warn!("end-drag without an active drag");
        return Ok(json!({
            "success": true,
            "warning": "end-drag without an active drag",
        }));
    }
    glide_to(ctx, x, y).await?;
    input::mouse_up(ctx.page.conn(), x, y, MouseButton::Left).await?;
    ctx.pointer.is_dragging = false;
    ctx.overlay.drag_end().await;
    Ok(json!({"success": true, "dragging": false}))
}

async fn scroll(ctx: &mut StepCtx<'_>, up: bool, count: u32) -> Result<Value> {
    let delta = if up { -100.0 } else { 100.0 };
    let delay = if up { SCROLL_DELAY_UP } else { SCROLL_DELAY_DOWN };
    for _ in 0..count {
        input::wheel(ctx.page.conn(), ctx.pointer.x, ctx.pointer.y, delta).await?;
        tokio::time::sleep(delay).await;
    }
    Ok(json!({"success": true, "events": count, "direction": if up { "up" } else { "down" }}))
}

// ---------------------------------------------------------------------------
// Keyboard
// ---------------------------------------------------------------------------

/// Split a `:keypress` spec into `(modifier, key)`. A single hyphen after a
/// known modifier name marks a combo; everything else is a bare key (so
/// `ArrowDown` or even `-` stay intact).
pub fn parse_keypress_spec(spec: &str) -> (Option<&str>, &str) {
    if let Some((head, tail)) = spec.split_once('-')
        && !tail.is_empty()
        && input::modifier_bit(head).is_some()
    {
        return (Some(head), tail);
    }
    (None, spec)
}

async fn keypress(ctx: &mut StepCtx<'_>, spec: &str) -> Result<Value> {
    let conn = ctx.page.conn();
    let (modifier, key) = parse_keypress_spec(spec);
    let key_info = input::key_info(key);

    match modifier {
        None => {
            input::key_press(conn, &key_info, 0).await?;
        }
        Some(name) => {
            let bit = input::modifier_bit(name).unwrap_or(0);
            let mod_info = input::modifier_key_info(name);
            input::key_down(conn, &mod_info, 0).await?;
            let pressed = input::key_press(conn, &key_info, bit).await;
            // The modifier must come back up even when the main key failed.
            let released = input::key_up(conn, &mod_info, 0).await;
            pressed?;
            released?;
        }
    }
    Ok(json!({"success": true, "key": spec}))
}

async fn wait(ctx: &mut StepCtx<'_>, seconds: f64) -> Result<Value> {
    let total = Duration::from_secs_f64(seconds);
    let started = Instant::now();
    let mut last_shown = u64::MAX;
    while started.elapsed() < total {
        let remaining = total
            .saturating_sub(started.elapsed())
            .as_secs_f64()
            .ceil() as u64;
        if remaining != last_shown {
            ctx.overlay.show_countdown(remaining).await;
            last_shown = remaining;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(json!({"success": true, "waited": seconds}))
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

async fn navigate(ctx: &mut StepCtx<'_>, url: &str) -> Result<Value> {
    match ctx.page.goto(url, NAV_TIMEOUT).await? {
        NavOutcome::Loaded => {
            ctx.overlay.ensure_installed().await;
            Ok(json!({"success": true, "url": url}))
        }
        NavOutcome::TimedOut { reason } => {
            warn!(url, reason, "navigation timed out, rendering timeout page");
            render_timeout_page(ctx, url, NAV_TIMEOUT.as_secs()).await;
            Ok(json!({
                "success": false,
                "isNavigationTimeout": true,
                "url": url,
                "reason": reason,
            }))
        }
    }
}

/// Best-effort swap to the local timeout page so post-state artifacts show
/// something meaningful instead of a blank tab.
pub async fn render_timeout_page(ctx: &mut StepCtx<'_>, url: &str, timeout_secs: u64) {
    let path = ctx.store.root().join("timeout.html");
    ctx.store.write_soft(&path, TIMEOUT_PAGE_HTML.as_bytes());
    let Ok(abs) = path.canonicalize() else {
        return;
    };
    let file_url = format!(
        "file://{}?url={}&timeout={}%20seconds",
        abs.display(),
        urlencoding::encode(url),
        timeout_secs,
    );
    if let Err(e) = ctx.page.goto(&file_url, Duration::from_secs(5)).await {
        warn!(error = %format!("{e:#}"), "failed to render timeout page");
    }
    ctx.overlay.ensure_installed().await;
}

async fn history(ctx: &mut StepCtx<'_>, offset: i64) -> Result<Value> {
    let moved = ctx.page.history_step(offset).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    ctx.overlay.ensure_installed().await;
    Ok(json!({"success": true, "moved": moved}))
}

// ---------------------------------------------------------------------------
// PDF & file IO
// ---------------------------------------------------------------------------

async fn print_pdf(ctx: &mut StepCtx<'_>, dialog: bool, a4: bool, landscape: bool) -> Result<Value> {
    if dialog {
        ctx.page.open_print_dialog().await?;
        return Ok(json!({"success": true, "mode": "dialog"}));
    }
    let bytes = ctx.page.print_to_pdf(a4, landscape).await?;
    let name = format!(
        "rabbitize-{}.pdf",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    );
    let path = ctx.store.pdfs_dir().join(&name);
    ctx.store
        .write_atomic(&path, &bytes)
        .context("Failed to write PDF")?;
    info!(path = %path.display(), bytes = bytes.len(), "PDF written");
    Ok(json!({
        "success": true,
        "mode": "auto",
        "path": path.to_string_lossy(),
        "bytes": bytes.len(),
    }))
}

async fn set_download_path(ctx: &mut StepCtx<'_>, path: &str) -> Result<Value> {
    let dir = PathBuf::from(path);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create download dir {}", dir.display()))?;
    let abs = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    ctx.page.set_download_dir(&abs).await?;
    spawn_download_mirror(
        ctx.page.conn().subscribe("Browser.downloadWillBegin"),
        ctx.page.conn().subscribe("Browser.downloadProgress"),
        abs.clone(),
        ctx.store.root().to_path_buf(),
    );
    Ok(json!({"success": true, "downloadPath": abs.to_string_lossy()}))
}

/// Mirror completed downloads into the session root so the artifact tree is
/// self-contained. Fire-and-forget; failures only warn.
fn spawn_download_mirror(
    mut begins: mpsc::UnboundedReceiver<Value>,
    mut progress: mpsc::UnboundedReceiver<Value>,
    download_dir: PathBuf,
    session_root: PathBuf,
) {
    tokio::spawn(async move {
        let mut names: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        loop {
            tokio::select! {
                begin = begins.recv() => {
                    let Some(begin) = begin else { break };
                    if let (Some(guid), Some(name)) = (
                        begin.get("guid").and_then(|v| v.as_str()),
                        begin.get("suggestedFilename").and_then(|v| v.as_str()),
                    ) {
                        names.insert(guid.to_string(), name.to_string());
                    }
                }
                update = progress.recv() => {
                    let Some(update) = update else { break };
                    if update.get("state").and_then(|v| v.as_str()) != Some("completed") {
                        continue;
                    }
                    let Some(guid) = update.get("guid").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let Some(name) = names.remove(guid) else { continue };
                    let src = download_dir.join(&name);
                    let dst = session_root.join(&name);
                    match std::fs::copy(&src, &dst) {
                        Ok(_) => debug!(file = %name, "download mirrored into session root"),
                        Err(e) => warn!(file = %name, error = %e, "download mirror failed"),
                    }
                }
            }
        }
    });
}

async fn set_upload_file(ctx: &mut StepCtx<'_>, paths: &[String]) -> Result<Value> {
    let mut resolved = Vec::with_capacity(paths.len());
    for p in paths {
        let path = Path::new(p);
        if !path.is_file() {
            anyhow::bail!("Upload file does not exist: {p}");
        }
        resolved.push(
            path.canonicalize()
                .with_context(|| format!("Failed to resolve {p}"))?
                .to_string_lossy()
                .into_owned(),
        );
    }
    *ctx.armed_uploads.lock().unwrap() = Some(resolved.clone());
    info!(files = resolved.len(), "file chooser armed (single-shot)");
    Ok(json!({"success": true, "armed": resolved}))
}

// ---------------------------------------------------------------------------
// Extraction & rabbit-eyes
// ---------------------------------------------------------------------------

async fn extract_cmd(
    ctx: &mut StepCtx<'_>,
    rect: Option<(f64, f64, f64, f64)>,
) -> Result<Value> {
    let conn = ctx.page.conn();
    let result = match rect {
        Some(rect) => extract::extract_rect(conn, rect).await?,
        None => extract::extract_at(conn, ctx.pointer.x, ctx.pointer.y).await?,
    };
    Ok(json!({"success": true, "extracted": result}))
}

async fn rabbit_eyes(
    ctx: &mut StepCtx<'_>,
    prompt: &str,
    rect: Option<(f64, f64, f64, f64)>,
) -> Result<Value> {
    let llm = RabbitEyes::from_env()?;

    let shot = match rect {
        Some((x1, y1, x2, y2)) => {
            let clip = ClipRect {
                x: x1.min(x2),
                y: y1.min(y2),
                w: (x2 - x1).abs().max(1.0),
                h: (y2 - y1).abs().max(1.0),
            };
            ctx.page.screenshot_clip_jpeg(&clip, 70).await?
        }
        None => ctx.page.screenshot_jpeg(70).await?,
    };
    let shot_path = ctx
        .store
        .root()
        .join("screenshots")
        .join(format!("{}_rabbit_eyes.jpg", ctx.index));
    ctx.store.write_soft(&shot_path, &shot);

    let answer = llm
        .ask(
            prompt,
            &base64::engine::general_purpose::STANDARD.encode(&shot),
        )
        .await?;

    ctx.overlay.show_answer_modal(&answer).await;
    let with_answer = ctx.page.screenshot_jpeg(70).await?;
    ctx.overlay.remove_answer_modal().await;
    let answer_path = ctx
        .store
        .root()
        .join("screenshots")
        .join(format!("{}_rabbit_eyes_answer.jpg", ctx.index));
    ctx.store.write_soft(&answer_path, &with_answer);

    Ok(json!({
        "success": true,
        "answer": answer,
        "prompt": prompt,
        "screenshot": shot_path.to_string_lossy(),
        "screenshotWithAnswer": answer_path.to_string_lossy(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypress_spec_splits_known_modifiers() {
        assert_eq!(parse_keypress_spec("Control-a"), (Some("Control"), "a"));
        assert_eq!(parse_keypress_spec("Shift-Tab"), (Some("Shift"), "Tab"));
        assert_eq!(parse_keypress_spec("Meta-Enter"), (Some("Meta"), "Enter"));
    }

    #[test]
    fn keypress_spec_keeps_plain_keys_intact() {
        assert_eq!(parse_keypress_spec("ArrowDown"), (None, "ArrowDown"));
        assert_eq!(parse_keypress_spec("Enter"), (None, "Enter"));
        assert_eq!(parse_keypress_spec("-"), (None, "-"));
        // Unknown prefix is not a modifier combo.
        assert_eq!(parse_keypress_spec("Foo-a"), (None, "Foo-a"));
    }

    #[test]
    fn pointer_hold_flags_map_buttons() {
        let mut p = PointerState::default();
        *p.held(MouseButton::Right) = true;
        assert!(p.is_right_mouse_down);
        assert!(!p.is_mouse_down);
        assert!(!p.is_middle_mouse_down);
    }

    #[test]
    fn timeout_page_mentions_placeholders() {
        assert!(TIMEOUT_PAGE_HTML.contains("Navigation timed out"));
        assert!(TIMEOUT_PAGE_HTML.contains("timeout"));
    }
}
