use std::path::{Path, PathBuf};

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::artifacts::RUNS_ROOT;
use crate::preview::FrameTopic;
use crate::queue::{CommandQueue, QueueRequest};

/// Shared handler state: the queue is the only way in; the frame topic is
/// the only way to watch.
#[derive(Clone)]
pub struct AppState {
    pub queue: CommandQueue,
    pub frames: FrameTopic,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start))
        .route("/execute", post(execute))
        .route("/end", post(end))
        .route("/status", get(queue_status))
        .route("/api/sessions", get(sessions_index))
        .route("/api/session/:client/:test/:session", get(session_detail))
        .route(
            "/api/session/:client/:test/:session/step/:index",
            get(session_step),
        )
        .route(
            "/api/session/:client/:test/:session/frame.jpg",
            get(session_frame),
        )
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "HTTP API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn start(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    let request = QueueRequest::Start {
        url: body["url"].as_str().unwrap_or_default().to_string(),
        client_id: body["clientId"].as_str().unwrap_or("default").to_string(),
        test_id: body["testId"].as_str().unwrap_or("default").to_string(),
        session_id: body["sessionId"].as_str().map(str::to_string),
        total_commands: body["options"]["totalCommands"].as_u64(),
    };
    let id = state.queue.enqueue(request);
    Json(json!({"queued": true, "id": id}))
}

async fn execute(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let command = body["command"]
        .as_array()
        .cloned()
        .ok_or(StatusCode::BAD_REQUEST)?;
    let id = state.queue.enqueue(QueueRequest::Execute { command });
    Ok(Json(json!({"queued": true, "id": id})))
}

async fn end(State(state): State<AppState>, body: Option<Json<Value>>) -> Json<Value> {
    let quick_cleanup = body
        .as_ref()
        .and_then(|Json(b)| b["quickCleanup"].as_bool())
        .unwrap_or(false);
    let id = state.queue.enqueue(QueueRequest::End {
        quick_cleanup,
        auto_inactivity: false,
    });
    Json(json!({"queued": true, "id": id}))
}

async fn queue_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.queue.status())
}

/// Cross-session index: every session directory's `status.json` plus, when
/// present, its `session-metadata.json`.
async fn sessions_index() -> Json<Value> {
    let mut sessions = Vec::new();
    let root = Path::new(RUNS_ROOT);
    for client in read_dirs(root) {
        for test in read_dirs(&client) {
            for session in read_dirs(&test) {
                let status = read_json(&session.join("status.json"));
                let metadata = read_json(&session.join("session-metadata.json"));
                if status.is_null() && metadata.is_null() {
                    continue;
                }
                sessions.push(json!({
                    "path": session.to_string_lossy(),
                    "status": status,
                    "metadata": metadata,
                }));
            }
        }
    }
    Json(json!({"sessions": sessions}))
}

async fn session_detail(
    UrlPath((client, test, session)): UrlPath<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let root = session_root(&client, &test, &session)?;
    let commands = read_json(&root.join("commands.json"));
    let commands = commands.as_array().cloned().unwrap_or_default();
    let (timing_data, total_duration) = timing_data(&commands);

    let mut zoom_images: Vec<String> = std::fs::read_dir(root.join("screenshots"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with("_zoom.jpg"))
                .collect()
        })
        .unwrap_or_default();
    zoom_images.sort_by_key(|name| {
        name.split('_')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(u64::MAX)
    });

    Ok(Json(json!({
        "zoomImages": zoom_images,
        "timingData": timing_data,
        "totalDuration": total_duration,
    })))
}

async fn session_step(
    UrlPath((client, test, session, index)): UrlPath<(String, String, String, u64)>,
) -> Result<Json<Value>, StatusCode> {
    let root = session_root(&client, &test, &session)?;
    let commands = read_json(&root.join("commands.json"));
    let record = commands
        .as_array()
        .and_then(|arr| arr.get(index as usize))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;

    let screenshots_dir = root.join("screenshots");
    let pre = find_step_file(&screenshots_dir, &format!("{index}-pre-"));
    let post = find_step_file(&screenshots_dir, &format!("{index}-post-"));

    let metrics = read_json(&root.join("metrics.json"));
    let step_metrics: Vec<Value> = metrics
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter(|m| m["commandIndex"].as_u64() == Some(index))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let dom = read_json(&root.join("dom_coords").join(format!("dom_coords_{index}.json")));
    let clip = root
        .join("video")
        .join("commands_ts")
        .join(format!("command_{index}.mp4"));

    Ok(Json(json!({
        "command": record["command"],
        "screenshots": {"pre": pre, "post": post},
        "timing": {
            "timestamp": record["timestamp"],
            "endTimestamp": record["endTimestamp"],
            "duration": record["duration"],
        },
        "metrics": step_metrics,
        "dom": dom,
        "videoClip": clip.is_file().then(|| clip.to_string_lossy().into_owned()),
    })))
}

/// One live preview frame from the in-process topic. 404 when no pump is
/// publishing for the session (not started, or already ended).
async fn session_frame(
    State(state): State<AppState>,
    UrlPath((client, test, session)): UrlPath<(String, String, String)>,
) -> Result<([(axum::http::HeaderName, &'static str); 1], Vec<u8>), StatusCode> {
    let key = format!("{client}/{test}/{session}");
    let mut rx = state.frames.subscribe(&key);
    let frame = tokio::time::timeout(std::time::Duration::from_secs(3), rx.recv())
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(([(axum::http::header::CONTENT_TYPE, "image/jpeg")], frame))
}

/// Per-command timing rows plus the session's total span, derived from
/// `commands.json`.
fn timing_data(commands: &[Value]) -> (Vec<Value>, i64) {
    let first_start = commands
        .first()
        .and_then(|c| c["timestamp"].as_i64())
        .unwrap_or(0);
    let mut rows = Vec::with_capacity(commands.len());
    let mut prev_end: Option<i64> = None;
    let mut last_end = first_start;

    for command in commands {
        let start = command["timestamp"].as_i64().unwrap_or(first_start);
        let end = command["endTimestamp"].as_i64().unwrap_or(start);
        rows.push(json!({
            "command": command["command"],
            "relativeStart": start - first_start,
            "duration": command["duration"],
            "gapBefore": prev_end.map(|p| (start - p).max(0)).unwrap_or(0),
        }));
        prev_end = Some(end);
        last_end = last_end.max(end);
    }
    (rows, last_end - first_start)
}

fn session_root(client: &str, test: &str, session: &str) -> Result<PathBuf, StatusCode> {
    // Path segments must stay segments; anything resembling traversal 404s.
    for part in [client, test, session] {
        if part.contains('/') || part.contains("..") || part.is_empty() {
            return Err(StatusCode::NOT_FOUND);
        }
    }
    let root = Path::new(RUNS_ROOT).join(client).join(test).join(session);
    if !root.is_dir() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(root)
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

fn read_json(path: &Path) -> Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(Value::Null)
}

fn find_step_file(dir: &Path, prefix: &str) -> Option<String> {
    std::fs::read_dir(dir).ok()?.find_map(|entry| {
        let name = entry.ok()?.file_name().to_string_lossy().into_owned();
        name.starts_with(prefix).then_some(name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(start: i64, end: i64) -> Value {
        json!({
            "command": [":click"],
            "timestamp": start,
            "endTimestamp": end,
            "duration": end - start,
            "output": {"success": true},
        })
    }

    #[test]
    fn timing_rows_are_relative_with_gaps() {
        let commands = vec![command(1000, 1500), command(1700, 2000)];
        let (rows, total) = timing_data(&commands);
        assert_eq!(rows[0]["relativeStart"], json!(0));
        assert_eq!(rows[0]["gapBefore"], json!(0));
        assert_eq!(rows[1]["relativeStart"], json!(700));
        assert_eq!(rows[1]["gapBefore"], json!(200));
        assert_eq!(total, 1000);
    }

    #[test]
    fn empty_sessions_have_zero_duration() {
        let (rows, total) = timing_data(&[]);
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn traversal_segments_are_rejected() {
        assert!(session_root("..", "t", "s").is_err());
        assert!(session_root("c", "a/b", "s").is_err());
        assert!(session_root("", "t", "s").is_err());
    }
}
