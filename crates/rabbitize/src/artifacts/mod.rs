pub mod dom;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::RgbaImage;
use image::imageops::FilterType;
use serde::Serialize;
use tracing::warn;

/// Root directory all session trees live under, relative to CWD.
pub const RUNS_ROOT: &str = "rabbitize-runs";

/// Zoom crop output size and source windows. 200px at a 40px source window
/// is the 5x effective zoom; click verbs tighten the window for a closer
/// look at the press point.
const ZOOM_OUT: u32 = 200;
const ZOOM_WINDOW: u32 = 40;
const ZOOM_WINDOW_CLICK: u32 = 24;

const THUMB_WIDTH: u32 = 500;

/// Writes the per-session artifact tree. Append-only: every step writes to
/// fresh paths, so there is no cross-step contention. All JSON that external
/// observers poll goes through temp-then-rename.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(client_id: &str, test_id: &str, session_id: &str) -> Self {
        let root = Path::new(RUNS_ROOT)
            .join(client_id)
            .join(test_id)
            .join(session_id);
        Self { root }
    }

    pub fn at_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the full directory skeleton.
    pub fn ensure_tree(&self) -> Result<()> {
        for sub in [
            "screenshots",
            "video",
            "dom_snapshots",
            "dom_coords",
            "pdfs",
        ] {
            let dir = self.root.join(sub);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    // -- per-step paths --

    pub fn pre_screenshot(&self, index: u64, verb: &str) -> PathBuf {
        self.root
            .join("screenshots")
            .join(format!("{index}-pre-{}.jpg", sanitize_verb(verb)))
    }

    pub fn post_screenshot(&self, index: u64, verb: &str) -> PathBuf {
        self.root
            .join("screenshots")
            .join(format!("{index}-post-{}.jpg", sanitize_verb(verb)))
    }

    pub fn canonical(&self, index: u64) -> PathBuf {
        self.root.join("screenshots").join(format!("{index}.jpg"))
    }

    pub fn thumb(&self, index: u64) -> PathBuf {
        self.root
            .join("screenshots")
            .join(format!("{index}_thumb.jpg"))
    }

    pub fn zoom(&self, index: u64) -> PathBuf {
        self.root
            .join("screenshots")
            .join(format!("{index}_zoom.jpg"))
    }

    pub fn dom_snapshot(&self, index: u64) -> PathBuf {
        self.root.join("dom_snapshots").join(format!("dom_{index}.md"))
    }

    pub fn dom_coords(&self, index: u64) -> PathBuf {
        self.root
            .join("dom_coords")
            .join(format!("dom_coords_{index}.json"))
    }

    pub fn dom_coords_initial(&self) -> PathBuf {
        self.root.join("dom_coords").join("dom_coords_initial.json")
    }

    // -- root-level mirrors and logs --

    pub fn latest_jpg(&self) -> PathBuf {
        self.root.join("latest.jpg")
    }

    pub fn latest_md(&self) -> PathBuf {
        self.root.join("latest.md")
    }

    pub fn latest_json(&self) -> PathBuf {
        self.root.join("latest.json")
    }

    pub fn commands_json(&self) -> PathBuf {
        self.root.join("commands.json")
    }

    pub fn metrics_json(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub fn status_json(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn session_metadata(&self) -> PathBuf {
        self.root.join("session-metadata.json")
    }

    pub fn color_patterns(&self) -> PathBuf {
        self.root.join("color-patterns.json")
    }

    pub fn last_command_idx(&self) -> PathBuf {
        self.root.join("last-command-idx")
    }

    pub fn pdfs_dir(&self) -> PathBuf {
        self.root.join("pdfs")
    }

    // -- video paths --

    pub fn video_dir(&self) -> PathBuf {
        self.root.join("video")
    }

    pub fn session_webm(&self) -> PathBuf {
        self.video_dir().join("session.webm")
    }

    pub fn session_mp4(&self) -> PathBuf {
        self.video_dir().join("session.mp4")
    }

    pub fn session_mp4_4x(&self) -> PathBuf {
        self.video_dir().join("session_4x.mp4")
    }

    pub fn cover_gif(&self) -> PathBuf {
        self.video_dir().join("cover.gif")
    }

    pub fn cover_jpg(&self) -> PathBuf {
        self.video_dir().join("cover.jpg")
    }

    // -- writes --

    /// Temp-then-rename in the target's directory, so concurrent readers
    /// never observe a torn file.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("No parent for {}", path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let file_name = path
            .file_name()
            .with_context(|| format!("No file name in {}", path.display()))?;
        let tmp = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename into {}", path.display()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
        self.write_atomic(path, &bytes)
    }

    /// Best-effort write: artifact failures are warn-and-continue, never a
    /// reason to abort a step.
    pub fn write_soft(&self, path: &Path, bytes: &[u8]) {
        if let Err(e) = self.write_atomic(path, bytes) {
            warn!(path = %path.display(), error = %format!("{e:#}"), "artifact write failed");
        }
    }

    /// Post-stability processing of the raw PNG: canonical JPEG (q=35),
    /// thumbnail (width 500, q=80), mouse zoom crop (200x200, q=20), and the
    /// `latest.jpg` mirror. The raw PNG never touches disk.
    pub fn process_step_png(
        &self,
        png: &[u8],
        index: u64,
        mouse: (f64, f64),
        tighten_zoom: bool,
    ) -> Result<()> {
        let img = image::load_from_memory(png)
            .context("Failed to decode post-stability PNG")?
            .to_rgba8();

        let canonical = encode_jpeg(&img, 35)?;
        self.write_atomic(&self.canonical(index), &canonical)?;
        self.write_soft(&self.latest_jpg(), &canonical);

        let thumb_h =
            (THUMB_WIDTH as u64 * img.height().max(1) as u64 / img.width().max(1) as u64) as u32;
        let thumb = image::imageops::resize(&img, THUMB_WIDTH, thumb_h.max(1), FilterType::Triangle);
        self.write_atomic(&self.thumb(index), &encode_jpeg(&thumb, 80)?)?;

        let window = if tighten_zoom {
            ZOOM_WINDOW_CLICK
        } else {
            ZOOM_WINDOW
        };
        let (zx, zy) = zoom_origin(mouse, window, (img.width(), img.height()));
        let crop = image::imageops::crop_imm(&img, zx, zy, window, window).to_image();
        let zoomed = image::imageops::resize(&crop, ZOOM_OUT, ZOOM_OUT, FilterType::Nearest);
        self.write_atomic(&self.zoom(index), &encode_jpeg(&zoomed, 20)?)?;

        Ok(())
    }
}

/// Strip the leading colon and keep filenames shell-friendly.
pub fn sanitize_verb(verb: &str) -> String {
    verb.trim_start_matches(':')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Top-left corner of a `window`-sized crop centered on `mouse`, clamped to
/// image bounds.
fn zoom_origin(mouse: (f64, f64), window: u32, dims: (u32, u32)) -> (u32, u32) {
    let half = (window / 2) as f64;
    let max_x = dims.0.saturating_sub(window) as f64;
    let max_y = dims.1.saturating_sub(window) as f64;
    let x = (mouse.0 - half).clamp(0.0, max_x.max(0.0));
    let y = (mouse.1 - half).clamp(0.0, max_y.max(0.0));
    (x as u32, y as u32)
}

pub fn encode_jpeg(img: &RgbaImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let rgb = image::DynamicImage::ImageRgba8(img.clone()).to_rgb8();
    let mut cursor = std::io::Cursor::new(&mut buf);
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
    encoder
        .encode_image(&rgb)
        .context("Failed to encode JPEG")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> ArtifactStore {
        ArtifactStore::at_root(dir.join("client").join("test").join("sess"))
    }

    #[test]
    fn tree_layout_is_deterministic() {
        let store = ArtifactStore::new("acme", "checkout", "2026-01-01T00-00-00-000Z");
        assert_eq!(
            store.root(),
            Path::new("rabbitize-runs/acme/checkout/2026-01-01T00-00-00-000Z")
        );
        assert!(
            store
                .pre_screenshot(3, ":move-mouse")
                .ends_with("screenshots/3-pre-move-mouse.jpg")
        );
        assert!(store.dom_coords(0).ends_with("dom_coords/dom_coords_0.json"));
        assert!(store.dom_snapshot(2).ends_with("dom_snapshots/dom_2.md"));
    }

    #[test]
    fn ensure_tree_creates_all_subdirs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.ensure_tree().unwrap();
        for sub in ["screenshots", "video", "dom_snapshots", "dom_coords", "pdfs"] {
            assert!(store.root().join(sub).is_dir(), "{sub}");
        }
    }

    #[test]
    fn atomic_write_leaves_no_temp_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.ensure_tree().unwrap();
        let path = store.status_json();
        store.write_atomic(&path, b"{\"phase\":\"x\"}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"phase\":\"x\"}");
        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn step_png_produces_the_full_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.ensure_tree().unwrap();

        let img = RgbaImage::from_pixel(640, 480, image::Rgba([120, 130, 140, 255]));
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        store
            .process_step_png(&png, 1, (320.0, 240.0), false)
            .unwrap();

        for path in [
            store.canonical(1),
            store.thumb(1),
            store.zoom(1),
            store.latest_jpg(),
        ] {
            assert!(path.is_file(), "{}", path.display());
        }

        let zoom = image::open(store.zoom(1)).unwrap();
        assert_eq!((zoom.width(), zoom.height()), (ZOOM_OUT, ZOOM_OUT));
        let thumb = image::open(store.thumb(1)).unwrap();
        assert_eq!(thumb.width(), THUMB_WIDTH);
    }

    #[test]
    fn zoom_origin_is_centered_and_clamped() {
        assert_eq!(zoom_origin((100.0, 100.0), 40, (640, 480)), (80, 80));
        assert_eq!(zoom_origin((0.0, 0.0), 40, (640, 480)), (0, 0));
        assert_eq!(zoom_origin((639.0, 479.0), 40, (640, 480)), (600, 440));
    }

    #[test]
    fn verbs_sanitize_to_filename_safe() {
        assert_eq!(sanitize_verb(":move-mouse"), "move-mouse");
        assert_eq!(sanitize_verb(":print-pdf"), "print-pdf");
        assert_eq!(sanitize_verb(":weird verb!"), "weird-verb-");
    }
}
