use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use serde_json::Value;

use crate::session::EngineConfig;
use crate::stability::StabilityConfig;

#[derive(Parser, Debug)]
#[command(
    name = "rabbitize",
    about = "Session-based visual browser automation with full artifact capture"
)]
pub struct Cli {
    #[arg(long, default_value = "default")]
    pub client_id: String,

    #[arg(long, default_value = "default")]
    pub test_id: String,

    /// Deterministic session id for batch runs; generated when omitted
    #[arg(long, env = "SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Cursor sprite, command text, and tracking-pixel overlays
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub show_overlay: bool,

    /// Scene-split the recording into per-command clips at session end
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub clip_segments: bool,

    /// Run the video post-processing pipeline at session end
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub process_video: bool,

    /// Exit the process after the session ends cleanly
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub exit_on_end: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub stability_detection: bool,

    /// Visual settle window in seconds
    #[arg(long, default_value_t = 2.0)]
    pub stability_wait: f64,

    /// Per-frame delta threshold (0.0-1.0)
    #[arg(long, default_value_t = 0.02)]
    pub stability_sensitivity: f64,

    /// Hard cap per stability wait, in milliseconds
    #[arg(long, default_value_t = 15_000)]
    pub stability_timeout: u64,

    /// Stability poll interval in milliseconds
    #[arg(long, default_value_t = 250)]
    pub stability_interval: u64,

    /// Consecutive timeouts before stability auto-disables
    #[arg(long, default_value_t = 1)]
    pub stability_timeout_threshold: u32,

    /// Live preview refresh in seconds (0 = ~10fps)
    #[arg(long, default_value_t = 0)]
    pub refresh_rate: u64,

    /// Connect to a remote Chrome (`http://host:port`) instead of launching one
    #[arg(long)]
    pub chrome_url: Option<String>,

    /// URL for a batch run (start -> commands -> end without HTTP driving)
    #[arg(long)]
    pub batch_url: Option<String>,

    /// JSON array of command arrays, e.g. `[[":click"],[":wait",2]]`
    #[arg(long)]
    pub batch_commands: Option<String>,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            show_overlay: self.show_overlay,
            process_video: self.process_video,
            clip_segments: self.clip_segments,
            record_video: true,
            stability: StabilityConfig {
                wait_time_secs: self.stability_wait,
                sensitivity: self.stability_sensitivity,
                interval_ms: self.stability_interval,
                timeout_ms: self.stability_timeout,
                downscale_width: 128,
                timeout_threshold: self.stability_timeout_threshold,
            },
            stability_enabled: self.stability_detection,
            preview_refresh_secs: self.refresh_rate,
            port: self.port,
            chrome_url: self.chrome_url.clone(),
        }
    }

    /// Parse `--batch-commands` into command arrays.
    pub fn batch(&self) -> Result<Option<Vec<Vec<Value>>>> {
        let Some(raw) = &self.batch_commands else {
            return Ok(None);
        };
        let parsed: Value =
            serde_json::from_str(raw).context("--batch-commands is not valid JSON")?;
        let Some(outer) = parsed.as_array() else {
            bail!("--batch-commands must be a JSON array of command arrays");
        };
        let mut commands = Vec::with_capacity(outer.len());
        for entry in outer {
            let Some(command) = entry.as_array() else {
                bail!("--batch-commands entries must be arrays, got {entry}");
            };
            commands.push(command.clone());
        }
        Ok(Some(commands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_the_contract() {
        let cli = Cli::try_parse_from(["rabbitize"]).unwrap();
        assert_eq!(cli.client_id, "default");
        assert_eq!(cli.port, 8080);
        assert!(cli.show_overlay);
        assert!(!cli.clip_segments);
        assert!(!cli.process_video);
        assert!(!cli.exit_on_end);
        assert!(cli.stability_detection);
        assert_eq!(cli.stability_timeout_threshold, 1);
    }

    #[test]
    fn boolean_flags_take_explicit_values() {
        let cli =
            Cli::try_parse_from(["rabbitize", "--show-overlay", "false", "--process-video", "true"])
                .unwrap();
        assert!(!cli.show_overlay);
        assert!(cli.process_video);
    }

    #[test]
    fn batch_commands_parse() {
        let cli = Cli::try_parse_from([
            "rabbitize",
            "--batch-url",
            "https://example.com",
            "--batch-commands",
            r#"[[":move-mouse", ":to", 400, 300], [":click"]]"#,
        ])
        .unwrap();
        let batch = cli.batch().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1][0], serde_json::json!(":click"));
    }

    #[test]
    fn malformed_batch_commands_error() {
        let cli = Cli::try_parse_from(["rabbitize", "--batch-commands", "{\"not\": \"array\"}"])
            .unwrap();
        assert!(cli.batch().is_err());
    }
}
