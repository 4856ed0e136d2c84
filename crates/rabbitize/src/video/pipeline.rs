use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use super::encoder::{probe_duration, run_ffmpeg, run_ffmpeg_stderr};
use crate::artifacts::{ArtifactStore, sanitize_verb};
use crate::session::CommandRecord;

/// Cover animation length cap (seconds).
const COVER_SECONDS: &str = "47";

/// Scene-change threshold over the tracking-pixel crop. The corner swings
/// between saturated pattern colors, red, and black, so real command
/// boundaries score far above this.
const SCENE_THRESHOLD: &str = "0.15";

/// End-of-session post-processing: webm -> mp4, cover animation, optional
/// scene split + per-command clips, 4x speed version. Every stage is
/// warn-and-continue except the base mp4 conversion, which later stages
/// need.
pub async fn run_pipeline<F: FnMut(&str)>(
    store: &ArtifactStore,
    records: &[CommandRecord],
    clip_segments: bool,
    video_start_ms: i64,
    mut on_phase: F,
) -> Result<()> {
    let webm = store.session_webm();
    let mp4 = store.session_mp4();

    on_phase("converting_to_mp4");
    convert_to_mp4(&webm, &mp4).await?;

    if let Err(e) = create_cover(store, &mp4).await {
        warn!(error = %format!("{e:#}"), "cover generation failed");
    }

    if clip_segments {
        on_phase("detecting_scenes");
        match detect_scenes(&mp4).await {
            Ok(scenes) => {
                on_phase("cutting_clips");
                if let Err(e) = cut_clips(store, &mp4, &scenes, records, video_start_ms).await {
                    warn!(error = %format!("{e:#}"), "scene clip cutting failed");
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "scene detection failed"),
        }
        if let Err(e) = cut_timestamp_clips(store, &mp4, records, video_start_ms).await {
            warn!(error = %format!("{e:#}"), "timestamp clip cutting failed");
        }
    }

    on_phase("creating_4x_video_version");
    if let Err(e) = speed_4x(&mp4, &store.session_mp4_4x()).await {
        warn!(error = %format!("{e:#}"), "4x version failed");
    }

    Ok(())
}

async fn convert_to_mp4(webm: &Path, mp4: &Path) -> Result<()> {
    run_ffmpeg(&[
        "-y",
        "-i",
        &webm.to_string_lossy(),
        "-c:v",
        "libx264",
        "-preset",
        "medium",
        "-tune",
        "film",
        "-crf",
        "28",
        "-maxrate",
        "2M",
        "-bufsize",
        "16M",
        "-g",
        "30",
        "-bf",
        "2",
        "-movflags",
        "+faststart",
        &mp4.to_string_lossy(),
    ])
    .await
    .context("webm -> mp4 conversion failed")?;
    info!(mp4 = %mp4.display(), "mp4 written");
    Ok(())
}

/// 200px square cover animation; falls back to a single-frame JPEG when gif
/// encoding fails.
async fn create_cover(store: &ArtifactStore, mp4: &Path) -> Result<()> {
    let gif = store.cover_gif();
    let gif_result = run_ffmpeg(&[
        "-y",
        "-t",
        COVER_SECONDS,
        "-i",
        &mp4.to_string_lossy(),
        "-vf",
        "fps=12,scale=200:200:force_original_aspect_ratio=increase:flags=lanczos,\
         crop=200:200,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse=dither=sierra2_4a",
        &gif.to_string_lossy(),
    ])
    .await;

    if let Err(e) = gif_result {
        warn!(error = %format!("{e:#}"), "cover.gif failed, falling back to cover.jpg");
        run_ffmpeg(&[
            "-y",
            "-i",
            &mp4.to_string_lossy(),
            "-frames:v",
            "1",
            "-vf",
            "scale=200:-1",
            &store.cover_jpg().to_string_lossy(),
        ])
        .await
        .context("cover.jpg fallback failed")?;
    }
    Ok(())
}

/// Scene-split the tracking-pixel corner: crop the bottom-right 8x8 and
/// look for hard color cuts.
async fn detect_scenes(mp4: &Path) -> Result<Vec<f64>> {
    let filter = format!(
        "crop=8:8:iw-8:ih-8,select='gt(scene,{SCENE_THRESHOLD})',showinfo"
    );
    let stderr = run_ffmpeg_stderr(&[
        "-i",
        &mp4.to_string_lossy(),
        "-vf",
        &filter,
        "-f",
        "null",
        "-",
    ])
    .await?;
    let times = parse_showinfo_times(&stderr);
    info!(scenes = times.len(), "scene cuts detected");
    Ok(times)
}

/// Pull `pts_time:` values out of showinfo stderr lines.
fn parse_showinfo_times(stderr: &str) -> Vec<f64> {
    let mut times = Vec::new();
    for line in stderr.lines() {
        let Some(idx) = line.find("pts_time:") else {
            continue;
        };
        let rest = &line[idx + "pts_time:".len()..];
        let token: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(t) = token.parse() {
            times.push(t);
        }
    }
    times
}

/// Turn scene cut timestamps into `(start, end)` segments covering the
/// whole video.
fn scene_segments(cuts: &[f64], duration: f64) -> Vec<(f64, f64)> {
    let mut bounds = Vec::with_capacity(cuts.len() + 2);
    bounds.push(0.0);
    bounds.extend(cuts.iter().copied().filter(|t| *t > 0.0 && *t < duration));
    bounds.push(duration);
    bounds
        .windows(2)
        .filter(|w| w[1] - w[0] > 0.05)
        .map(|w| (w[0], w[1]))
        .collect()
}

/// The command whose recorded window contains the segment start.
fn command_for_offset(
    records: &[CommandRecord],
    video_start_ms: i64,
    offset_secs: f64,
) -> Option<&CommandRecord> {
    let at_ms = video_start_ms + (offset_secs * 1000.0) as i64;
    records.iter().find(|r| {
        let end = r.ended_at.unwrap_or(i64::MAX);
        r.started_at <= at_ms && at_ms < end
    })
}

async fn cut_clips(
    store: &ArtifactStore,
    mp4: &Path,
    cuts: &[f64],
    records: &[CommandRecord],
    video_start_ms: i64,
) -> Result<()> {
    let duration = probe_duration(mp4).await?;
    let segments = scene_segments(cuts, duration);

    let clips_dir = store.video_dir().join("clips");
    let videos_dir = store.video_dir().join("command_videos");
    let gifs_dir = store.video_dir().join("command_gifs");
    for dir in [&clips_dir, &videos_dir, &gifs_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let mut mapping = Vec::new();
    for (n, (start, end)) in segments.iter().enumerate() {
        let (index, verb) = match command_for_offset(records, video_start_ms, *start) {
            Some(r) => (r.index, r.verb.clone()),
            None => continue, // idle gap between commands
        };
        let name = format!("clip_{n}_{index}_{}.mp4", sanitize_verb(&verb));
        let clip = clips_dir.join(&name);
        run_ffmpeg(&[
            "-y",
            "-ss",
            &format!("{start:.3}"),
            "-to",
            &format!("{end:.3}"),
            "-i",
            &mp4.to_string_lossy(),
            "-c",
            "copy",
            &clip.to_string_lossy(),
        ])
        .await
        .with_context(|| format!("Failed to cut {name}"))?;

        // Group by command index.
        let grouped = videos_dir.join(format!("command_{index}_{n}.mp4"));
        let _ = std::fs::copy(&clip, &grouped);
        let gif = gifs_dir.join(format!("command_{index}_{n}.gif"));
        if let Err(e) = clip_to_gif(&clip, &gif).await {
            warn!(error = %format!("{e:#}"), "clip gif failed");
        }

        mapping.push(json!({
            "clip": name,
            "scene": n,
            "commandIndex": index,
            "verb": verb,
            "start": start,
            "end": end,
        }));
    }

    store.write_json_atomic(
        &store.video_dir().join("clip_mapping.json"),
        &json!({"clips": mapping}),
    )?;
    Ok(())
}

/// Per-command cuts straight from the recorded timestamps, independent of
/// scene detection.
async fn cut_timestamp_clips(
    store: &ArtifactStore,
    mp4: &Path,
    records: &[CommandRecord],
    video_start_ms: i64,
) -> Result<()> {
    let ts_dir = store.video_dir().join("commands_ts");
    std::fs::create_dir_all(&ts_dir)
        .with_context(|| format!("Failed to create {}", ts_dir.display()))?;
    let duration = probe_duration(mp4).await?;

    let mut mapping = Vec::new();
    for record in records {
        let Some(ended_at) = record.ended_at else {
            continue;
        };
        let start = ((record.started_at - video_start_ms) as f64 / 1000.0).max(0.0);
        let end = ((ended_at - video_start_ms) as f64 / 1000.0).min(duration);
        if end - start < 0.05 || start >= duration {
            continue;
        }

        let index = record.index;
        let clip = ts_dir.join(format!("command_{index}.mp4"));
        run_ffmpeg(&[
            "-y",
            "-ss",
            &format!("{start:.3}"),
            "-to",
            &format!("{end:.3}"),
            "-i",
            &mp4.to_string_lossy(),
            "-c",
            "copy",
            &clip.to_string_lossy(),
        ])
        .await
        .with_context(|| format!("Failed to cut command_{index}.mp4"))?;

        let gif = ts_dir.join(format!("command_{index}.gif"));
        if let Err(e) = clip_to_gif(&clip, &gif).await {
            warn!(error = %format!("{e:#}"), "timestamp gif failed");
        }

        mapping.push(json!({
            "commandIndex": index,
            "verb": record.verb,
            "start": start,
            "end": end,
            "file": format!("command_{index}.mp4"),
        }));
    }

    store.write_json_atomic(
        &store.video_dir().join("timestamp_mapping.json"),
        &json!({"commands": mapping}),
    )?;
    Ok(())
}

async fn clip_to_gif(clip: &Path, gif: &Path) -> Result<()> {
    run_ffmpeg(&[
        "-y",
        "-i",
        &clip.to_string_lossy(),
        "-vf",
        "fps=8,scale=320:-1:flags=lanczos",
        &gif.to_string_lossy(),
    ])
    .await
}

async fn speed_4x(mp4: &Path, out: &Path) -> Result<()> {
    run_ffmpeg(&[
        "-y",
        "-i",
        &mp4.to_string_lossy(),
        "-vf",
        "setpts=0.25*PTS",
        "-an",
        &out.to_string_lossy(),
    ])
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::engine::CommandStatus;

    fn record(index: u64, started_at: i64, ended_at: i64) -> CommandRecord {
        CommandRecord {
            index,
            verb: ":click".to_string(),
            args: json!([":click"]),
            queued_at: started_at,
            started_at,
            ended_at: Some(ended_at),
            status: CommandStatus::Done,
            duration_ms: Some((ended_at - started_at) as u64),
            output: json!({"success": true}),
        }
    }

    #[test]
    fn showinfo_times_parse() {
        let stderr = "\
[Parsed_showinfo_2 @ 0x1] n:   0 pts:  12345 pts_time:1.234 duration: 1\n\
noise line\n\
[Parsed_showinfo_2 @ 0x1] n:   1 pts:  99999 pts_time:7.5 duration: 1\n";
        assert_eq!(parse_showinfo_times(stderr), vec![1.234, 7.5]);
    }

    #[test]
    fn segments_cover_the_whole_video() {
        let segments = scene_segments(&[2.0, 5.0], 10.0);
        assert_eq!(segments, vec![(0.0, 2.0), (2.0, 5.0), (5.0, 10.0)]);
    }

    #[test]
    fn segments_drop_degenerate_cuts() {
        let segments = scene_segments(&[0.0, 0.01, 10.0, 12.0], 10.0);
        assert_eq!(segments, vec![(0.01, 10.0)]);
    }

    #[test]
    fn offsets_map_to_the_running_command() {
        let records = vec![record(0, 1_000, 3_000), record(1, 3_000, 6_000)];
        // Video started at epoch 0ms; offset 2.5s falls inside command 0.
        assert_eq!(command_for_offset(&records, 0, 2.5).unwrap().index, 0);
        assert_eq!(command_for_offset(&records, 0, 4.0).unwrap().index, 1);
        assert!(command_for_offset(&records, 0, 9.0).is_none());
    }
}
