pub mod scripts;

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, warn};

use crate::cdp::CdpConnection;

/// Palette the tracking-pixel patterns draw from. Saturated, far apart in
/// RGB so ffmpeg scene detection on the corner crop sees hard cuts.
const PATTERN_PALETTE: [&str; 12] = [
    "#ff0040", "#ff8000", "#ffee00", "#40ff00", "#00ffaa", "#00eeff",
    "#0080ff", "#4000ff", "#aa00ff", "#ff00ee", "#ffffff", "#804000",
];

/// Overlay surface: cursor sprite, command text, time overlay, tracking
/// pixel. Owns the verb -> color-pattern map persisted as
/// `color-patterns.json`.
pub struct Overlay {
    conn: CdpConnection,
    enabled: bool,
    interactive: bool,
    patterns: BTreeMap<String, [String; 4]>,
}

impl Overlay {
    pub fn new(conn: CdpConnection, enabled: bool, interactive: bool) -> Self {
        Self {
            conn,
            enabled,
            interactive,
            patterns: BTreeMap::new(),
        }
    }

    fn install_source(&self) -> String {
        scripts::OVERLAY_INSTALL_JS.replace(
            "INTERACTIVE_PLACEHOLDER",
            if self.interactive { "true" } else { "false" },
        )
    }

    /// Register the installer to run in every new document, then install
    /// into the current one. Idempotent on the page side.
    pub async fn install(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.conn
            .call(
                "Page.addScriptToEvaluateOnNewDocument",
                serde_json::json!({"source": self.install_source()}),
            )
            .await?;
        self.ensure_installed().await;
        Ok(())
    }

    /// Re-evaluate the installer in the current document. Safe to call after
    /// every navigation; the sentinel makes it a no-op when already present.
    pub async fn ensure_installed(&self) {
        if !self.enabled {
            return;
        }
        if let Err(e) = self.conn.eval(&self.install_source()).await {
            warn!(error = %format!("{e:#}"), "overlay install failed");
        }
    }

    /// Fire an overlay helper, tolerating pages where the overlay is absent
    /// (disabled, or torn down by a navigation mid-step). Never load-bearing.
    async fn fire(&self, call: &str) {
        if !self.enabled {
            return;
        }
        let expr = format!("window.__rabbitize && window.__rabbitize.{call}");
        if let Err(e) = self.conn.eval(&expr).await {
            debug!(call, error = %format!("{e:#}"), "overlay call failed");
        }
    }

    pub async fn move_cursor(&self, x: f64, y: f64) {
        self.fire(&format!("moveCursor({x}, {y})")).await;
    }

    pub async fn press(&self, button: &str) {
        self.fire(&format!("press({})", js_string(button))).await;
    }

    pub async fn release(&self) {
        self.fire("release()").await;
    }

    pub async fn ripple(&self, x: f64, y: f64) {
        self.fire(&format!("ripple({x}, {y})")).await;
    }

    pub async fn drag_start(&self) {
        self.fire("dragStart()").await;
    }

    pub async fn drag_end(&self) {
        self.fire("dragEnd()").await;
    }

    /// Show the raw command JSON in the bottom-right box for ~2s.
    pub async fn show_command(&self, command_json: &str) {
        self.fire(&format!("showCommand({}, 2000)", js_string(command_json)))
            .await;
    }

    /// Update the command box without resetting its visual rhythm; used by
    /// `:wait` countdowns.
    pub async fn show_countdown(&self, remaining_secs: u64) {
        self.fire(&format!(
            "showCommand({}, 400)",
            js_string(&format!("waiting {remaining_secs}s"))
        ))
        .await;
    }

    pub async fn paint_red(&self) {
        self.fire("patternRed()").await;
    }

    pub async fn paint_black(&self) {
        self.fire("patternBlack()").await;
    }

    /// Paint the verb's deterministic 4-color pattern, minting it on first
    /// sight of the verb.
    pub async fn paint_pattern(&self, verb: &str) {
        let pattern = self.pattern_for(verb);
        let arr = serde_json::to_string(&pattern).unwrap_or_else(|_| "[]".into());
        self.fire(&format!("setPattern({arr})")).await;
    }

    pub async fn show_answer_modal(&self, text: &str) {
        self.fire(&format!("showAnswerModal({})", js_string(text)))
            .await;
    }

    pub async fn remove_answer_modal(&self) {
        self.fire("removeAnswerModal()").await;
    }

    /// Record the verb's pattern in the persisted map (mint if new) and
    /// return it.
    pub fn record_pattern(&mut self, verb: &str) -> [String; 4] {
        if let Some(p) = self.patterns.get(verb) {
            return p.clone();
        }
        let p = pattern_for_verb(verb);
        self.patterns.insert(verb.to_string(), p.clone());
        p
    }

    fn pattern_for(&self, verb: &str) -> [String; 4] {
        self.patterns
            .get(verb)
            .cloned()
            .unwrap_or_else(|| pattern_for_verb(verb))
    }

    /// verb -> pattern map for `color-patterns.json`.
    pub fn patterns(&self) -> &BTreeMap<String, [String; 4]> {
        &self.patterns
    }
}

/// Deterministic 4-color pattern for a verb: FNV-1a over the verb name,
/// one palette pick per hash byte. Stable across runs and platforms.
pub fn pattern_for_verb(verb: &str) -> [String; 4] {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in verb.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut out: [String; 4] = Default::default();
    for (i, slot) in out.iter_mut().enumerate() {
        let idx = ((hash >> (i * 8)) & 0xff) as usize % PATTERN_PALETTE.len();
        *slot = PATTERN_PALETTE[idx].to_string();
    }
    out
}

/// Quote a Rust string as a JS string literal.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_are_deterministic() {
        assert_eq!(pattern_for_verb(":click"), pattern_for_verb(":click"));
        assert_eq!(
            pattern_for_verb(":scroll-wheel-down"),
            pattern_for_verb(":scroll-wheel-down")
        );
    }

    #[test]
    fn distinct_verbs_usually_differ() {
        // Not a collision-freedom guarantee, just a sanity check that the
        // hash actually feeds the palette.
        let a = pattern_for_verb(":click");
        let b = pattern_for_verb(":navigate");
        let c = pattern_for_verb(":type");
        assert!(a != b || b != c);
    }

    #[test]
    fn pattern_colors_come_from_palette() {
        for color in pattern_for_verb(":drag") {
            assert!(PATTERN_PALETTE.contains(&color.as_str()));
        }
    }

    #[test]
    fn js_string_escapes_quotes() {
        assert_eq!(js_string(r#"a"b"#), r#""a\"b""#);
    }
}
