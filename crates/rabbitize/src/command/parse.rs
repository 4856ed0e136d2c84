use serde_json::Value;

use crate::browser::input::MouseButton;
use crate::error::CommandError;

/// A parsed command: verb plus positional args, as received on the wire as
/// `["<verb>", args…]`. Verbs are matched verbatim — leading colon,
/// lowercase, hyphenated.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Navigate { url: String },
    MoveMouse { x: f64, y: f64 },
    Click { button: MouseButton },
    ClickHold { button: MouseButton },
    ClickRelease { button: MouseButton },
    Drag { from: (f64, f64), to: (f64, f64) },
    StartDrag { x: f64, y: f64 },
    EndDrag { x: f64, y: f64 },
    Scroll { up: bool, count: u32 },
    Type { text: String },
    Keypress { spec: String },
    Wait { seconds: f64 },
    Back,
    Forward,
    Width { delta: i32 },
    Height { delta: i32 },
    PrintPdf { dialog: bool, a4: bool, landscape: bool },
    SetDownloadPath { path: String },
    SetUploadFile { paths: Vec<String> },
    Extract { rect: Option<(f64, f64, f64, f64)> },
    ExtractPage,
    RabbitEyes { prompt: String, rect: Option<(f64, f64, f64, f64)> },
}

fn bad(msg: impl Into<String>) -> CommandError {
    CommandError::BadArgs(msg.into())
}

impl Command {
    /// The canonical verb string (what artifacts and color patterns key on).
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => ":navigate",
            Self::MoveMouse { .. } => ":move-mouse",
            Self::Click { button } => match button {
                MouseButton::Left => ":click",
                MouseButton::Right => ":right-click",
                MouseButton::Middle => ":middle-click",
            },
            Self::ClickHold { button } => match button {
                MouseButton::Left => ":click-hold",
                MouseButton::Right => ":right-click-hold",
                MouseButton::Middle => ":middle-click-hold",
            },
            Self::ClickRelease { button } => match button {
                MouseButton::Left => ":click-release",
                MouseButton::Right => ":right-click-release",
                MouseButton::Middle => ":middle-click-release",
            },
            Self::Drag { .. } => ":drag",
            Self::StartDrag { .. } => ":start-drag",
            Self::EndDrag { .. } => ":end-drag",
            Self::Scroll { up: true, .. } => ":scroll-wheel-up",
            Self::Scroll { up: false, .. } => ":scroll-wheel-down",
            Self::Type { .. } => ":type",
            Self::Keypress { .. } => ":keypress",
            Self::Wait { .. } => ":wait",
            Self::Back => ":back",
            Self::Forward => ":forward",
            Self::Width { .. } => ":width",
            Self::Height { .. } => ":height",
            Self::PrintPdf { .. } => ":print-pdf",
            Self::SetDownloadPath { .. } => ":set-download-path",
            Self::SetUploadFile { .. } => ":set-upload-file",
            Self::Extract { .. } => ":extract",
            Self::ExtractPage => ":extract-page",
            Self::RabbitEyes { .. } => ":rabbit-eyes",
        }
    }

    /// Click-family verbs tighten the zoom crop around the press point.
    pub fn is_click_family(&self) -> bool {
        matches!(
            self,
            Self::Click { .. } | Self::ClickHold { .. } | Self::ClickRelease { .. }
        )
    }

    /// Parse a wire command array. The first element is the verb; the rest
    /// are positional args (numbers may arrive as JSON numbers or numeric
    /// strings).
    pub fn parse(raw: &[Value]) -> Result<Self, CommandError> {
        let verb = raw
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad("Command must start with a verb string"))?;
        let args = &raw[1..];

        let cmd = match verb {
            ":navigate" | ":url" => Self::Navigate {
                url: string_arg(args, 0, "URL")?,
            },
            ":move-mouse" => {
                let (x, y) = keyword_pair(args, ":to")?;
                Self::MoveMouse { x, y }
            }
            ":click" => Self::Click { button: MouseButton::Left },
            ":right-click" => Self::Click { button: MouseButton::Right },
            ":middle-click" => Self::Click { button: MouseButton::Middle },
            ":click-hold" => Self::ClickHold { button: MouseButton::Left },
            ":click-release" => Self::ClickRelease { button: MouseButton::Left },
            ":right-click-hold" => Self::ClickHold { button: MouseButton::Right },
            ":right-click-release" => Self::ClickRelease { button: MouseButton::Right },
            ":middle-click-hold" => Self::ClickHold { button: MouseButton::Middle },
            ":middle-click-release" => Self::ClickRelease { button: MouseButton::Middle },
            ":drag" => {
                let from = keyword_pair(args, ":from")?;
                let to = keyword_pair(args, ":to")?;
                Self::Drag { from, to }
            }
            ":start-drag" => {
                let (x, y) = keyword_pair(args, ":from")?;
                Self::StartDrag { x, y }
            }
            ":end-drag" => {
                let (x, y) = keyword_pair(args, ":from")?;
                Self::EndDrag { x, y }
            }
            ":scroll-wheel-up" => Self::Scroll {
                up: true,
                count: count_arg(args)?,
            },
            ":scroll-wheel-down" => Self::Scroll {
                up: false,
                count: count_arg(args)?,
            },
            ":type" => Self::Type {
                text: string_arg(args, 0, "TEXT")?,
            },
            ":keypress" => Self::Keypress {
                spec: string_arg(args, 0, "KEY")?,
            },
            ":wait" => {
                let seconds = number_arg(args, 0, "SECONDS")?;
                if seconds < 0.0 {
                    return Err(bad(":wait requires a non-negative number of seconds"));
                }
                Self::Wait { seconds }
            }
            ":back" => Self::Back,
            ":forward" => Self::Forward,
            ":width" => Self::Width {
                delta: number_arg(args, 0, "DELTA")? as i32,
            },
            ":height" => Self::Height {
                delta: number_arg(args, 0, "DELTA")? as i32,
            },
            ":print-pdf" => parse_print_pdf(args)?,
            ":set-download-path" => Self::SetDownloadPath {
                path: string_arg(args, 0, "PATH")?,
            },
            ":set-upload-file" => {
                let paths: Vec<String> = args
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect();
                if paths.is_empty() {
                    return Err(bad(":set-upload-file requires at least one path"));
                }
                Self::SetUploadFile { paths }
            }
            ":extract" => Self::Extract {
                rect: optional_rect(args, 0)?,
            },
            ":extract-page" => Self::ExtractPage,
            ":rabbit-eyes" => Self::RabbitEyes {
                prompt: string_arg(args, 0, "PROMPT")?,
                rect: optional_rect(args, 1)?,
            },
            other => return Err(CommandError::UnknownVerb(other.to_string())),
        };
        Ok(cmd)
    }
}

fn parse_print_pdf(args: &[Value]) -> Result<Command, CommandError> {
    let mode = string_arg(args, 0, "MODE")?;
    let dialog = match mode.as_str() {
        "dialog" => true,
        "auto" => false,
        other => return Err(bad(format!(":print-pdf MODE must be dialog or auto, got {other}"))),
    };
    let format = args.get(1).and_then(|v| v.as_str()).unwrap_or("A4");
    let a4 = match format.to_ascii_lowercase().as_str() {
        "a4" => true,
        "letter" => false,
        other => return Err(bad(format!(":print-pdf FORMAT must be A4 or Letter, got {other}"))),
    };
    let orientation = args.get(2).and_then(|v| v.as_str()).unwrap_or("portrait");
    let landscape = match orientation.to_ascii_lowercase().as_str() {
        "portrait" => false,
        "landscape" => true,
        other => {
            return Err(bad(format!(
                ":print-pdf ORIENTATION must be portrait or landscape, got {other}"
            )));
        }
    };
    Ok(Command::PrintPdf { dialog, a4, landscape })
}

fn as_number(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str()?.parse().ok())
}

fn number_arg(args: &[Value], idx: usize, name: &str) -> Result<f64, CommandError> {
    args.get(idx)
        .and_then(as_number)
        .ok_or_else(|| bad(format!("Missing or non-numeric {name} argument")))
}

fn string_arg(args: &[Value], idx: usize, name: &str) -> Result<String, CommandError> {
    args.get(idx)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| bad(format!("Missing {name} argument")))
}

fn count_arg(args: &[Value]) -> Result<u32, CommandError> {
    let n = number_arg(args, 0, "N")?;
    if n < 0.0 {
        return Err(bad("Scroll count must be non-negative"));
    }
    Ok(n as u32)
}

/// Find `keyword` among the args and read the two numbers after it.
fn keyword_pair(args: &[Value], keyword: &str) -> Result<(f64, f64), CommandError> {
    let pos = args
        .iter()
        .position(|v| v.as_str() == Some(keyword))
        .ok_or_else(|| bad(format!("Missing {keyword} X Y")))?;
    let x = number_arg(args, pos + 1, "X")?;
    let y = number_arg(args, pos + 2, "Y")?;
    Ok((x, y))
}

/// Four numbers starting at `idx`, or None if absent entirely.
fn optional_rect(
    args: &[Value],
    idx: usize,
) -> Result<Option<(f64, f64, f64, f64)>, CommandError> {
    if args.len() <= idx {
        return Ok(None);
    }
    let x1 = number_arg(args, idx, "X1")?;
    let y1 = number_arg(args, idx + 1, "Y1")?;
    let x2 = number_arg(args, idx + 2, "X2")?;
    let y2 = number_arg(args, idx + 3, "Y2")?;
    Ok(Some((x1, y1, x2, y2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: Value) -> Result<Command, CommandError> {
        Command::parse(raw.as_array().unwrap())
    }

    #[test]
    fn move_mouse_with_keyword() {
        let cmd = parse(json!([":move-mouse", ":to", 400, 300])).unwrap();
        assert_eq!(cmd, Command::MoveMouse { x: 400.0, y: 300.0 });
        assert_eq!(cmd.verb(), ":move-mouse");
    }

    #[test]
    fn numeric_strings_accepted() {
        let cmd = parse(json!([":move-mouse", ":to", "400", "300"])).unwrap();
        assert_eq!(cmd, Command::MoveMouse { x: 400.0, y: 300.0 });
    }

    #[test]
    fn url_is_an_alias_for_navigate() {
        let a = parse(json!([":navigate", "https://example.com"])).unwrap();
        let b = parse(json!([":url", "https://example.com"])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn click_variants_map_buttons() {
        assert_eq!(
            parse(json!([":right-click"])).unwrap().verb(),
            ":right-click"
        );
        assert_eq!(
            parse(json!([":middle-click-hold"])).unwrap(),
            Command::ClickHold { button: MouseButton::Middle }
        );
        assert!(parse(json!([":click"])).unwrap().is_click_family());
        assert!(!parse(json!([":back"])).unwrap().is_click_family());
    }

    #[test]
    fn drag_parses_both_endpoints() {
        let cmd = parse(json!([":drag", ":from", 10, 20, ":to", 30, 40])).unwrap();
        assert_eq!(
            cmd,
            Command::Drag { from: (10.0, 20.0), to: (30.0, 40.0) }
        );
    }

    #[test]
    fn scroll_zero_is_allowed() {
        let cmd = parse(json!([":scroll-wheel-down", 0])).unwrap();
        assert_eq!(cmd, Command::Scroll { up: false, count: 0 });
    }

    #[test]
    fn print_pdf_modes() {
        let cmd = parse(json!([":print-pdf", "auto", "Letter", "landscape"])).unwrap();
        assert_eq!(
            cmd,
            Command::PrintPdf { dialog: false, a4: false, landscape: true }
        );
        assert!(matches!(
            parse(json!([":print-pdf", "sideways"])),
            Err(CommandError::BadArgs(_))
        ));
    }

    #[test]
    fn extract_with_and_without_rect() {
        assert_eq!(
            parse(json!([":extract"])).unwrap(),
            Command::Extract { rect: None }
        );
        assert_eq!(
            parse(json!([":extract", 0, 0, 100, 100])).unwrap(),
            Command::Extract { rect: Some((0.0, 0.0, 100.0, 100.0)) }
        );
        // Partial rects are malformed, not silently cursor-mode.
        assert!(parse(json!([":extract", 0, 0])).is_err());
    }

    #[test]
    fn rabbit_eyes_prompt_then_optional_rect() {
        let cmd = parse(json!([":rabbit-eyes", "what is shown?", 1, 2, 3, 4])).unwrap();
        assert_eq!(
            cmd,
            Command::RabbitEyes {
                prompt: "what is shown?".into(),
                rect: Some((1.0, 2.0, 3.0, 4.0)),
            }
        );
    }

    #[test]
    fn unknown_verbs_are_rejected_verbatim() {
        assert_eq!(
            parse(json!([":Click"])),
            Err(CommandError::UnknownVerb(":Click".to_string()))
        );
        assert_eq!(
            format!("{}", parse(json!(["click"])).unwrap_err()),
            "Unknown command: click"
        );
    }

    #[test]
    fn upload_requires_paths() {
        assert!(parse(json!([":set-upload-file"])).is_err());
        assert_eq!(
            parse(json!([":set-upload-file", "a.txt", "b.txt"])).unwrap(),
            Command::SetUploadFile { paths: vec!["a.txt".into(), "b.txt".into()] }
        );
    }
}
