use anyhow::{Context, Result};
use serde_json::Value;

use crate::cdp::CdpConnection;

/// DOM coordinate capture: a curated selector sweep of the interesting,
/// visible, in-viewport elements with their geometry and a trimmed set of
/// attributes. Emits `{viewport, metadata, elements}` as a JSON string.
const DOM_COORDS_JS: &str = r#"
(function() {
    var SELECTORS = [
        'h1, h2, h3, h4, h5, h6',
        'button, a, select, input, textarea, [role=button]',
        'nav, .nav, .navigation, .menu',
        'article, section, .card, .container, .content',
        'li',
        'td, th',
        'img[alt]',
        '[data-testid], [aria-label]'
    ];

    function isVisible(el) {
        var s = window.getComputedStyle(el);
        if (s.display === 'none' || s.visibility === 'hidden' || s.opacity === '0') return false;
        var r = el.getBoundingClientRect();
        return r.width > 0 && r.height > 0;
    }

    function inViewport(r) {
        return r.bottom > 0 && r.right > 0 &&
               r.top < window.innerHeight && r.left < window.innerWidth;
    }

    function keptAttributes(el) {
        var out = {};
        var names = ['href', 'alt', 'src', 'placeholder', 'type'];
        for (var i = 0; i < names.length; i++) {
            var v = el.getAttribute(names[i]);
            if (v !== null) out[names[i]] = v;
        }
        for (var j = 0; j < el.attributes.length; j++) {
            var a = el.attributes[j];
            if (a.name.indexOf('data-') === 0 || a.name.indexOf('aria-') === 0)
                out[a.name] = a.value;
        }
        return out;
    }

    function trimText(el) {
        var t = (el.innerText || el.textContent || '').trim().replace(/\s+/g, ' ');
        return t.length > 200 ? t.slice(0, 200) + '...' : t;
    }

    var seen = new Set();
    var elements = [];
    for (var s = 0; s < SELECTORS.length; s++) {
        var list;
        try { list = document.querySelectorAll(SELECTORS[s]); } catch (e) { continue; }
        for (var i = 0; i < list.length; i++) {
            var el = list[i];
            if (seen.has(el)) continue;
            seen.add(el);
            // List items only in short lists; long lists are noise.
            if (el.tagName === 'LI') {
                var parent = el.parentElement;
                if (!parent || parent.children.length >= 10) continue;
            }
            if (!isVisible(el)) continue;
            var r = el.getBoundingClientRect();
            if (!inViewport(r)) continue;
            elements.push({
                tagName: el.tagName.toLowerCase(),
                id: el.id || '',
                classNames: el.className && el.className.toString ? el.className.toString() : '',
                text: trimText(el),
                attributes: keptAttributes(el),
                position: {
                    x: Math.round(r.x), y: Math.round(r.y),
                    w: Math.round(r.width), h: Math.round(r.height),
                    centerX: Math.round(r.x + r.width / 2),
                    centerY: Math.round(r.y + r.height / 2)
                }
            });
        }
    }

    return JSON.stringify({
        viewport: { width: window.innerWidth, height: window.innerHeight },
        metadata: {
            title: document.title,
            url: window.location.href,
            timestamp: new Date().toISOString(),
            elementCount: elements.length
        },
        elements: elements
    });
})()
"#;

/// Walker-based visible-text rendering of the page in reading order:
/// headings by level, paragraphs, ordered/unordered lists, tables with a
/// header row, code blocks, blockquotes. This is the authoritative text
/// extraction (also what `latest.md` mirrors).
const PAGE_MARKDOWN_JS: &str = r#"
(function() {
    function isVisible(el) {
        var s = window.getComputedStyle(el);
        return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
    }

    function text(el) {
        return (el.innerText || '').trim().replace(/\s+/g, ' ');
    }

    var out = [];

    function renderTable(el) {
        var rows = el.querySelectorAll('tr');
        if (!rows.length) return;
        var lines = [];
        for (var i = 0; i < rows.length; i++) {
            var cells = rows[i].querySelectorAll('th, td');
            var parts = [];
            for (var j = 0; j < cells.length; j++) parts.push(text(cells[j]));
            lines.push('| ' + parts.join(' | ') + ' |');
            if (i === 0) {
                var seps = [];
                for (var k = 0; k < cells.length; k++) seps.push('---');
                lines.push('| ' + seps.join(' | ') + ' |');
            }
        }
        out.push(lines.join('\n'));
    }

    function renderList(el, ordered) {
        var items = el.children;
        var lines = [];
        var n = 1;
        for (var i = 0; i < items.length; i++) {
            if (items[i].tagName !== 'LI' || !isVisible(items[i])) continue;
            var t = text(items[i]);
            if (!t) continue;
            lines.push(ordered ? (n + '. ' + t) : ('- ' + t));
            n++;
        }
        if (lines.length) out.push(lines.join('\n'));
    }

    function walk(el) {
        if (el.nodeType !== 1 || !isVisible(el)) return;
        var tag = el.tagName;
        if (tag === 'SCRIPT' || tag === 'STYLE' || tag === 'NOSCRIPT') return;

        if (/^H[1-6]$/.test(tag)) {
            var t = text(el);
            if (t) out.push('#'.repeat(+tag[1]) + ' ' + t);
            return;
        }
        if (tag === 'P') {
            var p = text(el);
            if (p) out.push(p);
            return;
        }
        if (tag === 'UL') { renderList(el, false); return; }
        if (tag === 'OL') { renderList(el, true); return; }
        if (tag === 'TABLE') { renderTable(el); return; }
        if (tag === 'PRE') {
            var c = (el.innerText || '').replace(/\s+$/, '');
            if (c) out.push('```\n' + c + '\n```');
            return;
        }
        if (tag === 'BLOCKQUOTE') {
            var q = text(el);
            if (q) out.push('> ' + q);
            return;
        }

        var hasBlockChild = false;
        for (var i = 0; i < el.children.length; i++) {
            walk(el.children[i]);
            hasBlockChild = true;
        }
        if (!hasBlockChild) {
            var leaf = text(el);
            if (leaf) out.push(leaf);
        }
    }

    if (document.body) walk(document.body);
    return out.join('\n\n');
})()
"#;

/// Run the coordinate sweep and return the parsed envelope.
pub async fn capture_dom_coords(conn: &CdpConnection) -> Result<Value> {
    let result = conn.eval(DOM_COORDS_JS).await?;
    let json_str = string_value(&result).context("DOM coords: no string value returned")?;
    serde_json::from_str(json_str).context("Failed to parse DOM coords JSON")
}

/// Run the markdown walker and return the rendered text.
pub async fn capture_markdown(conn: &CdpConnection) -> Result<String> {
    let result = conn.eval(PAGE_MARKDOWN_JS).await?;
    Ok(string_value(&result).unwrap_or_default().to_string())
}

/// Pull the string payload out of a `Runtime.evaluate` result envelope.
fn string_value(result: &Value) -> Option<&str> {
    result["result"]["value"].as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_value_reads_the_evaluate_envelope() {
        let envelope = json!({"result": {"type": "string", "value": "{\"a\":1}"}});
        assert_eq!(string_value(&envelope), Some("{\"a\":1}"));
        assert_eq!(string_value(&json!({"result": {}})), None);
    }
}
