use anyhow::Result;
use serde_json::json;

use crate::cdp::CdpConnection;

/// CDP `Input.dispatchKeyEvent` modifier bitmask.
pub const MOD_ALT: u32 = 1;
pub const MOD_CTRL: u32 = 2;
pub const MOD_META: u32 = 4;
pub const MOD_SHIFT: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Middle => "middle",
        }
    }
}

pub async fn mouse_move(conn: &CdpConnection, x: f64, y: f64) -> Result<()> {
    conn.call(
        "Input.dispatchMouseEvent",
        json!({"type": "mouseMoved", "x": x, "y": y, "button": "none"}),
    )
    .await?;
    Ok(())
}

pub async fn mouse_down(conn: &CdpConnection, x: f64, y: f64, button: MouseButton) -> Result<()> {
    conn.call(
        "Input.dispatchMouseEvent",
        json!({
            "type": "mousePressed",
            "x": x,
            "y": y,
            "button": button.as_str(),
            "clickCount": 1,
        }),
    )
    .await?;
    Ok(())
}

pub async fn mouse_up(conn: &CdpConnection, x: f64, y: f64, button: MouseButton) -> Result<()> {
    conn.call(
        "Input.dispatchMouseEvent",
        json!({
            "type": "mouseReleased",
            "x": x,
            "y": y,
            "button": button.as_str(),
            "clickCount": 1,
        }),
    )
    .await?;
    Ok(())
}

pub async fn mouse_click(conn: &CdpConnection, x: f64, y: f64, button: MouseButton) -> Result<()> {
    mouse_down(conn, x, y, button).await?;
    mouse_up(conn, x, y, button).await?;
    Ok(())
}

/// One wheel event. Positive `delta_y` scrolls down.
pub async fn wheel(conn: &CdpConnection, x: f64, y: f64, delta_y: f64) -> Result<()> {
    conn.call(
        "Input.dispatchMouseEvent",
        json!({
            "type": "mouseWheel",
            "x": x,
            "y": y,
            "button": "none",
            "deltaX": 0,
            "deltaY": delta_y,
        }),
    )
    .await?;
    Ok(())
}

/// Type text into the focused element via `Input.insertText` (what the
/// browser does for IME commits; handles any unicode in one call).
pub async fn insert_text(conn: &CdpConnection, text: &str) -> Result<()> {
    conn.call("Input.insertText", json!({"text": text})).await?;
    Ok(())
}

/// Resolved key identity for `Input.dispatchKeyEvent`.
#[derive(Clone, Debug)]
pub struct KeyInfo {
    pub key: String,
    pub code: String,
    pub key_code: u32,
    /// Printable text for the keyDown, when the key produces any.
    pub text: Option<String>,
}

/// Resolve a key name (`Enter`, `ArrowDown`, `a`, `5`, …) to its DOM
/// identity. Single printable characters map through their char; named keys
/// come from a fixed table.
pub fn key_info(name: &str) -> KeyInfo {
    if let Some(named) = named_key(name) {
        return named;
    }

    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return char_key(c);
    }

    // Unknown multi-char name: pass through as-is and let the page decide.
    KeyInfo {
        key: name.to_string(),
        code: name.to_string(),
        key_code: 0,
        text: None,
    }
}

fn named_key(name: &str) -> Option<KeyInfo> {
    let (key, code, key_code): (&str, &str, u32) = match name {
        "Enter" | "Return" => ("Enter", "Enter", 13),
        "Tab" => ("Tab", "Tab", 9),
        "Escape" | "Esc" => ("Escape", "Escape", 27),
        "Backspace" => ("Backspace", "Backspace", 8),
        "Delete" => ("Delete", "Delete", 46),
        "Space" => (" ", "Space", 32),
        "ArrowUp" | "Up" => ("ArrowUp", "ArrowUp", 38),
        "ArrowDown" | "Down" => ("ArrowDown", "ArrowDown", 40),
        "ArrowLeft" | "Left" => ("ArrowLeft", "ArrowLeft", 37),
        "ArrowRight" | "Right" => ("ArrowRight", "ArrowRight", 39),
        "Home" => ("Home", "Home", 36),
        "End" => ("End", "End", 35),
        "PageUp" => ("PageUp", "PageUp", 33),
        "PageDown" => ("PageDown", "PageDown", 34),
        "F5" => ("F5", "F5", 116),
        _ => return None,
    };
    Some(KeyInfo {
        key: key.to_string(),
        code: code.to_string(),
        key_code,
        text: (key == " ").then(|| " ".to_string()),
    })
}

fn char_key(c: char) -> KeyInfo {
    let upper = c.to_ascii_uppercase();
    let (code, key_code) = if c.is_ascii_alphabetic() {
        (format!("Key{upper}"), upper as u32)
    } else if c.is_ascii_digit() {
        (format!("Digit{c}"), c as u32)
    } else {
        (String::new(), 0)
    };
    KeyInfo {
        key: c.to_string(),
        code,
        key_code,
        text: Some(c.to_string()),
    }
}

/// Modifier name -> `Input.dispatchKeyEvent` bitmask bit.
pub fn modifier_bit(name: &str) -> Option<u32> {
    match name {
        "Alt" | "Option" => Some(MOD_ALT),
        "Control" | "Ctrl" => Some(MOD_CTRL),
        "Meta" | "Cmd" | "Command" => Some(MOD_META),
        "Shift" => Some(MOD_SHIFT),
        _ => None,
    }
}

/// Modifier key identity (for the physical down/up of the modifier itself).
pub fn modifier_key_info(name: &str) -> KeyInfo {
    let (key, code, key_code): (&str, &str, u32) = match name {
        "Alt" | "Option" => ("Alt", "AltLeft", 18),
        "Control" | "Ctrl" => ("Control", "ControlLeft", 17),
        "Meta" | "Cmd" | "Command" => ("Meta", "MetaLeft", 91),
        "Shift" => ("Shift", "ShiftLeft", 16),
        other => (other, other, 0),
    };
    KeyInfo {
        key: key.to_string(),
        code: code.to_string(),
        key_code,
        text: None,
    }
}

pub async fn key_down(conn: &CdpConnection, info: &KeyInfo, modifiers: u32) -> Result<()> {
    let mut params = json!({
        "type": if info.text.is_some() { "keyDown" } else { "rawKeyDown" },
        "key": info.key,
        "code": info.code,
        "windowsVirtualKeyCode": info.key_code,
        "nativeVirtualKeyCode": info.key_code,
        "modifiers": modifiers,
    });
    if let Some(text) = &info.text {
        params["text"] = json!(text);
    }
    conn.call("Input.dispatchKeyEvent", params).await?;
    Ok(())
}

pub async fn key_up(conn: &CdpConnection, info: &KeyInfo, modifiers: u32) -> Result<()> {
    conn.call(
        "Input.dispatchKeyEvent",
        json!({
            "type": "keyUp",
            "key": info.key,
            "code": info.code,
            "windowsVirtualKeyCode": info.key_code,
            "nativeVirtualKeyCode": info.key_code,
            "modifiers": modifiers,
        }),
    )
    .await?;
    Ok(())
}

/// Press and release a key (with optional held modifier bits).
pub async fn key_press(conn: &CdpConnection, info: &KeyInfo, modifiers: u32) -> Result<()> {
    key_down(conn, info, modifiers).await?;
    key_up(conn, info, modifiers).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_resolve_to_key_codes() {
        let info = key_info("a");
        assert_eq!(info.key, "a");
        assert_eq!(info.code, "KeyA");
        assert_eq!(info.key_code, 65);
        assert_eq!(info.text.as_deref(), Some("a"));
    }

    #[test]
    fn named_keys_have_no_text() {
        let info = key_info("Enter");
        assert_eq!(info.key_code, 13);
        assert!(info.text.is_none());
    }

    #[test]
    fn space_is_printable() {
        let info = key_info("Space");
        assert_eq!(info.text.as_deref(), Some(" "));
    }

    #[test]
    fn modifier_bits() {
        assert_eq!(modifier_bit("Control"), Some(MOD_CTRL));
        assert_eq!(modifier_bit("Shift"), Some(MOD_SHIFT));
        assert_eq!(modifier_bit("Meta"), Some(MOD_META));
        assert_eq!(modifier_bit("Enter"), None);
    }
}
