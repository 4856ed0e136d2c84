/// Overlay installer, injected into every new document (and re-evaluated
/// after navigations). Idempotent via the `window.__rabbitize` sentinel.
///
/// Installs:
/// - circular cursor sprite with press/hover/drag animations and ripples
/// - command text overlay (bottom-right, ~2s)
/// - time overlay (bottom-left, interactive sessions only)
/// - 4x4 px tracking-pixel corner: a 2x2 grid of colored quadrants used to
///   embed a recoverable command timecode in the recording
/// - a capture-phase interceptor that reroutes trusted clicks on
///   `target="_blank"` / `rel="noopener"` anchors into the top frame
///
/// `INTERACTIVE_PLACEHOLDER` is replaced with `true`/`false` at install time.
pub(crate) const OVERLAY_INSTALL_JS: &str = r#"
(function() {
    if (window.__rabbitize) return 'already-installed';
    var INTERACTIVE = INTERACTIVE_PLACEHOLDER;
    var Z = 2147483646;

    function el(tag, styles) {
        var e = document.createElement(tag);
        for (var k in styles) e.style[k] = styles[k];
        return e;
    }

    function mount(e) {
        (document.body || document.documentElement).appendChild(e);
    }

    // -- cursor sprite --
    var cursor = el('div', {
        position: 'fixed', left: '0px', top: '0px',
        width: '24px', height: '24px',
        marginLeft: '-12px', marginTop: '-12px',
        borderRadius: '50%',
        background: 'rgba(229,57,53,0.85)',
        border: '2px solid rgba(255,255,255,0.9)',
        boxShadow: '0 0 6px rgba(0,0,0,0.4)',
        pointerEvents: 'none',
        zIndex: Z,
        transition: 'left 300ms ease, top 300ms ease, transform 150ms ease, background 150ms ease',
        transform: 'scale(1)',
    });
    mount(cursor);

    // -- command text overlay --
    var cmdBox = el('div', {
        position: 'fixed', right: '8px', bottom: '12px',
        maxWidth: '45vw',
        padding: '4px 8px',
        font: '12px monospace',
        color: '#9cff9c',
        background: 'rgba(0,0,0,0.72)',
        borderRadius: '4px',
        pointerEvents: 'none',
        zIndex: Z,
        display: 'none',
        whiteSpace: 'pre-wrap',
    });
    mount(cmdBox);
    var cmdTimer = null;

    // -- time overlay (interactive sessions only) --
    var clock = null;
    if (INTERACTIVE) {
        clock = el('div', {
            position: 'fixed', left: '8px', bottom: '4px',
            font: '11px monospace',
            color: '#ffffff',
            background: 'rgba(0,0,0,0.6)',
            padding: '1px 5px',
            borderRadius: '3px',
            pointerEvents: 'none',
            zIndex: Z,
        });
        mount(clock);
        setInterval(function() {
            clock.textContent = new Date().toISOString().slice(11, 23);
        }, 100);
    }

    // -- tracking-pixel corner: 4x4 px total, 2x2 grid of 2px quadrants --
    var corner = el('div', {
        position: 'fixed', right: '0px', bottom: '0px',
        width: '4px', height: '4px',
        display: 'grid',
        gridTemplateColumns: '2px 2px',
        gridTemplateRows: '2px 2px',
        pointerEvents: 'none',
        zIndex: Z + 1,
    });
    var quads = [];
    for (var i = 0; i < 4; i++) {
        var q = el('div', { width: '2px', height: '2px', background: '#000000' });
        quads.push(q);
        corner.appendChild(q);
    }
    mount(corner);

    // -- target=_blank interceptor (trusted clicks only) --
    document.addEventListener('click', function(ev) {
        if (!ev.isTrusted) return;
        var a = ev.target && ev.target.closest ? ev.target.closest('a') : null;
        if (!a || !a.href) return;
        var rel = (a.getAttribute('rel') || '');
        if (a.target === '_blank' || rel.indexOf('noopener') !== -1) {
            ev.preventDefault();
            ev.stopPropagation();
            window.top.location.href = a.href;
        }
    }, true);

    function hoverColor(x, y) {
        try {
            var t = document.elementFromPoint(x, y);
            if (!t) return 'rgba(229,57,53,0.85)';
            var s = window.getComputedStyle(t);
            var c = s.cursor || '';
            if (t.closest && t.closest('a') || c === 'pointer')
                return 'rgba(67,160,71,0.85)';
            if (c === 'grab' || c === 'grabbing' || c === 'move' ||
                c === 'all-scroll' || c.indexOf('-resize') !== -1)
                return 'rgba(30,136,229,0.85)';
        } catch (e) {}
        return 'rgba(229,57,53,0.85)';
    }

    window.__rabbitize = {
        moveCursor: function(x, y) {
            cursor.style.left = x + 'px';
            cursor.style.top = y + 'px';
            cursor.style.background = hoverColor(x, y);
        },
        press: function(button) {
            var color = button === 'right' ? 'rgba(21,101,192,0.95)'
                      : button === 'middle' ? 'rgba(46,125,50,0.95)'
                      : 'rgba(198,40,40,0.95)';
            cursor.style.background = color;
            cursor.style.transform = 'scale(1.5)';
        },
        release: function() {
            cursor.style.transform = 'scale(1)';
            cursor.style.background = 'rgba(229,57,53,0.85)';
        },
        dragStart: function() {
            cursor.style.transform = 'scale(1.8)';
            cursor.style.background = 'rgba(30,136,229,0.95)';
        },
        dragEnd: function() {
            cursor.style.transform = 'scale(1)';
            cursor.style.background = 'rgba(229,57,53,0.85)';
        },
        ripple: function(x, y) {
            var r = el('div', {
                position: 'fixed', left: x + 'px', top: y + 'px',
                width: '12px', height: '12px',
                marginLeft: '-6px', marginTop: '-6px',
                borderRadius: '50%',
                border: '2px solid rgba(255,255,255,0.9)',
                pointerEvents: 'none',
                zIndex: Z - 1,
                transition: 'transform 550ms ease-out, opacity 550ms ease-out',
                transform: 'scale(1)', opacity: '1',
            });
            mount(r);
            requestAnimationFrame(function() {
                r.style.transform = 'scale(5)';
                r.style.opacity = '0';
            });
            setTimeout(function() { r.remove(); }, 600);
        },
        showCommand: function(text, ms) {
            cmdBox.textContent = text;
            cmdBox.style.display = 'block';
            if (cmdTimer) clearTimeout(cmdTimer);
            cmdTimer = setTimeout(function() {
                cmdBox.style.display = 'none';
            }, ms || 2000);
        },
        setPattern: function(colors) {
            for (var i = 0; i < 4; i++)
                quads[i].style.background = colors[i] || '#000000';
        },
        patternRed: function() {
            this.setPattern(['#ff0000', '#ff0000', '#ff0000', '#ff0000']);
        },
        patternBlack: function() {
            this.setPattern(['#000000', '#000000', '#000000', '#000000']);
        },
        showAnswerModal: function(text) {
            var m = el('div', {
                position: 'fixed', left: '50%', top: '50%',
                transform: 'translate(-50%, -50%)',
                maxWidth: '60vw', maxHeight: '60vh',
                overflow: 'auto',
                padding: '16px 20px',
                font: '14px sans-serif',
                color: '#111',
                background: 'rgba(255,255,255,0.97)',
                border: '2px solid #333',
                borderRadius: '8px',
                boxShadow: '0 4px 24px rgba(0,0,0,0.5)',
                whiteSpace: 'pre-wrap',
                zIndex: Z,
            });
            m.id = '__rabbitize-answer';
            m.textContent = text;
            mount(m);
        },
        removeAnswerModal: function() {
            var m = document.getElementById('__rabbitize-answer');
            if (m) m.remove();
        },
    };
    return 'installed';
})()
"#;
