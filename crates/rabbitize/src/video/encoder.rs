use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;

/// Run ffmpeg to completion. Stderr is captured and attached to the error
/// on a non-zero exit.
pub async fn run_ffmpeg(args: &[&str]) -> Result<()> {
    debug!(args = ?args, "ffmpeg");
    let output = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to spawn ffmpeg")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or_default()
        );
    }
    Ok(())
}

/// Run ffmpeg and return its stderr (filter chains like `showinfo` report
/// there).
pub async fn run_ffmpeg_stderr(args: &[&str]) -> Result<String> {
    debug!(args = ?args, "ffmpeg (capture)");
    let output = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to spawn ffmpeg")?;
    // Filters write to stderr whether or not the exit status is clean;
    // callers parse what they can.
    Ok(String::from_utf8_lossy(&output.stderr).into_owned())
}

/// Media duration in seconds via ffprobe.
pub async fn probe_duration(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .context("Failed to spawn ffprobe")?;
    if !output.status.success() {
        bail!("ffprobe exited with {}", output.status);
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .context("Unparseable ffprobe duration")
}
