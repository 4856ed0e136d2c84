use anyhow::{Context, Result};
use serde_json::Value;

use crate::cdp::CdpConnection;

/// Grid-sample visible text inside a rectangle: probe `elementFromPoint` on
/// a 10px lattice, keep visible text-bearing nodes, dedup by text. The
/// rect placeholders are substituted before evaluation.
const EXTRACT_RECT_JS: &str = r#"
(function() {
    var x1 = X1_PH, y1 = Y1_PH, x2 = X2_PH, y2 = Y2_PH;
    var left = Math.min(x1, x2), right = Math.max(x1, x2);
    var top = Math.min(y1, y2), bottom = Math.max(y1, y2);
    var STEP = 10;

    function isVisible(el) {
        var s = window.getComputedStyle(el);
        return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
    }

    var seen = new Set();
    var elements = [];
    for (var y = top; y <= bottom; y += STEP) {
        for (var x = left; x <= right; x += STEP) {
            var el = document.elementFromPoint(x, y);
            if (!el || !isVisible(el)) continue;
            var t = (el.innerText || el.textContent || '').trim().replace(/\s+/g, ' ');
            if (!t || seen.has(t)) continue;
            seen.add(t);
            var r = el.getBoundingClientRect();
            elements.push({
                text: t,
                bounds: {
                    x: Math.round(r.x), y: Math.round(r.y),
                    width: Math.round(r.width), height: Math.round(r.height)
                }
            });
        }
    }
    return JSON.stringify({
        elements: elements,
        bounds: { x1: left, y1: top, x2: right, y2: bottom }
    });
})()
"#;

/// Describe the element under a point (the cursor-mode `:extract`).
const EXTRACT_POINT_JS: &str = r#"
(function() {
    var el = document.elementFromPoint(X_PH, Y_PH);
    if (!el) return JSON.stringify(null);
    return JSON.stringify({
        text: (el.innerText || el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 500),
        tag: el.tagName.toLowerCase(),
        id: el.id || '',
        className: el.className && el.className.toString ? el.className.toString() : ''
    });
})()
"#;

pub async fn extract_rect(
    conn: &CdpConnection,
    rect: (f64, f64, f64, f64),
) -> Result<Value> {
    let js = EXTRACT_RECT_JS
        .replace("X1_PH", &rect.0.to_string())
        .replace("Y1_PH", &rect.1.to_string())
        .replace("X2_PH", &rect.2.to_string())
        .replace("Y2_PH", &rect.3.to_string());
    parse_string_result(&conn.eval(&js).await?)
}

pub async fn extract_at(conn: &CdpConnection, x: f64, y: f64) -> Result<Value> {
    let js = EXTRACT_POINT_JS
        .replace("X_PH", &x.to_string())
        .replace("Y_PH", &y.to_string());
    parse_string_result(&conn.eval(&js).await?)
}

fn parse_string_result(result: &Value) -> Result<Value> {
    let json_str = result["result"]["value"]
        .as_str()
        .context("Extraction returned no string value")?;
    serde_json::from_str(json_str).context("Failed to parse extraction JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_parsing() {
        let envelope = json!({"result": {"value": "{\"elements\":[],\"bounds\":{}}"}});
        let parsed = parse_string_result(&envelope).unwrap();
        assert!(parsed["elements"].as_array().unwrap().is_empty());
    }

    #[test]
    fn rect_substitution_hits_all_placeholders() {
        let js = EXTRACT_RECT_JS
            .replace("X1_PH", "1")
            .replace("Y1_PH", "2")
            .replace("X2_PH", "3")
            .replace("Y2_PH", "4");
        assert!(!js.contains("_PH"));
    }
}
