use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::GrayImage;
use image::imageops::FilterType;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::browser::Page;

/// Stability detector configuration. `frame_count` is derived:
/// `ceil(wait_time_ms / interval_ms)` consecutive quiet deltas settle.
#[derive(Clone, Copy, Debug)]
pub struct StabilityConfig {
    /// Target settle window in seconds.
    pub wait_time_secs: f64,
    /// Per-frame normalized delta threshold (0..1).
    pub sensitivity: f64,
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
    /// Hard cap in milliseconds.
    pub timeout_ms: u64,
    /// Width frames are downscaled to before differencing.
    pub downscale_width: u32,
    /// Consecutive timeouts before the detector auto-disables.
    pub timeout_threshold: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            wait_time_secs: 2.0,
            sensitivity: 0.02,
            interval_ms: 250,
            timeout_ms: 15_000,
            downscale_width: 128,
            timeout_threshold: 1,
        }
    }
}

impl StabilityConfig {
    pub fn frame_count(&self) -> usize {
        ((self.wait_time_secs * 1000.0) / self.interval_ms as f64).ceil() as usize
    }
}

/// Outcome of one stability wait.
#[derive(Debug, PartialEq, Eq)]
pub enum Settle {
    Settled,
    TimedOut,
    /// Detection is currently off (config, auto-disable, or never enabled).
    Disabled,
    Stopped,
}

/// Rolling window over frame deltas: settled when the last `frame_count`
/// deltas are all below `sensitivity`.
struct SettleTracker {
    deltas: VecDeque<f64>,
    frame_count: usize,
    sensitivity: f64,
}

impl SettleTracker {
    fn new(frame_count: usize, sensitivity: f64) -> Self {
        Self {
            deltas: VecDeque::new(),
            frame_count: frame_count.max(1),
            sensitivity,
        }
    }

    fn push(&mut self, delta: f64) -> bool {
        self.deltas.push_back(delta);
        while self.deltas.len() > self.frame_count {
            self.deltas.pop_front();
        }
        self.deltas.len() == self.frame_count
            && self.deltas.iter().all(|d| *d < self.sensitivity)
    }
}

/// Visual-settle detector: polls downscaled screenshots and reports settled
/// once a full quiet window has elapsed. Never fails a command; timeouts
/// bump a counter that can auto-disable the detector until the next
/// main-frame navigation re-enables it.
pub struct StabilityDetector {
    config: StabilityConfig,
    enabled: bool,
    /// False when `--stability-detection` was off at startup; auto-disable
    /// must not resurrect a detector the operator never wanted.
    configured_on: bool,
    consecutive_timeouts: u32,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

/// Cancels an in-flight (or future) stability wait.
#[derive(Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

impl StabilityDetector {
    pub fn new(config: StabilityConfig, enabled: bool) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            enabled,
            configured_on: enabled,
            consecutive_timeouts: 0,
            stop_tx,
            stop_rx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// A main-frame navigation resets the timeout streak and re-enables a
    /// detector that auto-disabled itself.
    pub fn note_navigation(&mut self) {
        self.consecutive_timeouts = 0;
        if self.configured_on && !self.enabled {
            info!("stability detection re-enabled after navigation");
            self.enabled = true;
        }
    }

    fn note_timeout(&mut self) {
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= self.config.timeout_threshold {
            warn!(
                consecutive = self.consecutive_timeouts,
                "stability detection auto-disabled until next navigation"
            );
            self.enabled = false;
        }
    }

    /// Poll until the page settles, the hard cap hits, or the stop handle
    /// fires. All outcomes are soft.
    pub async fn wait_for_stability(&mut self, page: &Page) -> Result<Settle> {
        if !self.enabled {
            return Ok(Settle::Disabled);
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.timeout_ms);
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut tracker = SettleTracker::new(self.config.frame_count(), self.config.sensitivity);
        let mut prev: Option<GrayImage> = None;
        let mut stop_rx = self.stop_rx.clone();

        loop {
            if *stop_rx.borrow() {
                return Ok(Settle::Stopped);
            }
            if Instant::now() >= deadline {
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stability wait hit hard cap"
                );
                self.note_timeout();
                return Ok(Settle::TimedOut);
            }

            let jpeg = page.screenshot_jpeg(40).await?;
            let frame = downscale_gray(&jpeg, self.config.downscale_width)?;

            if let Some(prev_frame) = &prev {
                let delta = frame_delta(prev_frame, &frame);
                if tracker.push(delta) {
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "page settled"
                    );
                    self.consecutive_timeouts = 0;
                    return Ok(Settle::Settled);
                }
            }
            prev = Some(frame);

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(Settle::Stopped);
                    }
                }
            }
        }
    }
}

/// Decode and downscale a screenshot to a small grayscale frame, preserving
/// aspect ratio.
fn downscale_gray(encoded: &[u8], width: u32) -> Result<GrayImage> {
    let img = image::load_from_memory(encoded)?;
    let (w, h) = (img.width().max(1), img.height().max(1));
    let target_h = (width as u64 * h as u64 / w as u64).max(1) as u32;
    Ok(image::imageops::resize(&img.to_luma8(), width, target_h, FilterType::Nearest))
}

/// Mean absolute luma difference, normalized to 0..1. Frames of different
/// sizes (mid-resize) count as a full-scale change.
pub fn frame_delta(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 1.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    let pixels = (a.width() as u64 * a.height() as u64).max(1);
    total as f64 / pixels as f64 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(w: u32, h: u32, v: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, image::Luma([v]))
    }

    #[test]
    fn identical_frames_have_zero_delta() {
        let a = gray(16, 16, 128);
        assert_eq!(frame_delta(&a, &a.clone()), 0.0);
    }

    #[test]
    fn full_swing_is_one() {
        let a = gray(8, 8, 0);
        let b = gray(8, 8, 255);
        assert!((frame_delta(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn size_change_counts_as_full_change() {
        let a = gray(8, 8, 10);
        let b = gray(8, 9, 10);
        assert_eq!(frame_delta(&a, &b), 1.0);
    }

    #[test]
    fn tracker_needs_a_full_quiet_window() {
        let mut t = SettleTracker::new(3, 0.05);
        assert!(!t.push(0.01));
        assert!(!t.push(0.01));
        assert!(t.push(0.01));
    }

    #[test]
    fn tracker_resets_on_noisy_frame() {
        let mut t = SettleTracker::new(2, 0.05);
        assert!(!t.push(0.01));
        assert!(!t.push(0.9)); // noisy frame stays inside the window
        assert!(!t.push(0.01));
        assert!(t.push(0.01));
    }

    #[test]
    fn frame_count_derivation() {
        let config = StabilityConfig {
            wait_time_secs: 1.0,
            interval_ms: 300,
            ..Default::default()
        };
        assert_eq!(config.frame_count(), 4); // ceil(1000 / 300)
    }

    #[test]
    fn auto_disable_and_reenable() {
        let config = StabilityConfig {
            timeout_threshold: 2,
            ..Default::default()
        };
        let mut d = StabilityDetector::new(config, true);
        d.note_timeout();
        assert!(d.is_enabled());
        d.note_timeout();
        assert!(!d.is_enabled());
        d.note_navigation();
        assert!(d.is_enabled());
    }

    #[test]
    fn never_enabled_stays_off_after_navigation() {
        let mut d = StabilityDetector::new(StabilityConfig::default(), false);
        d.note_navigation();
        assert!(!d.is_enabled());
    }
}
