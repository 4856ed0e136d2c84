use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::preview::FrameTopic;
use crate::session::{ActivityTracker, EngineConfig, SessionEngine, SessionIds};

/// Sessions idle longer than this are auto-ended.
const INACTIVITY_LIMIT: Duration = Duration::from_secs(15 * 60);

/// How many finished queue items are retained for observation.
const RETAINED_RECORDS: usize = 50;

/// A request accepted by the queue.
#[derive(Clone, Debug)]
pub enum QueueRequest {
    Start {
        url: String,
        client_id: String,
        test_id: String,
        /// None generates a fresh timestamp id.
        session_id: Option<String>,
        total_commands: Option<u64>,
    },
    Execute {
        command: Vec<Value>,
    },
    End {
        quick_cleanup: bool,
        /// Set when the inactivity watchdog requested the end.
        auto_inactivity: bool,
    },
}

impl QueueRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Execute { .. } => "execute",
            Self::End { .. } => "end",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Self::Start {
                url,
                client_id,
                test_id,
                session_id,
                total_commands,
            } => json!({
                "url": url,
                "clientId": client_id,
                "testId": test_id,
                "sessionId": session_id,
                "totalCommands": total_commands,
            }),
            Self::Execute { command } => json!({"command": command}),
            Self::End {
                quick_cleanup,
                auto_inactivity,
            } => json!({"quickCleanup": quick_cleanup, "autoInactivity": auto_inactivity}),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemRecord {
    pub id: u64,
    pub kind: String,
    pub payload: Value,
    /// queued | running | done | failed | skipped
    pub status: String,
    pub queued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Observer hooks fired from the consumer task.
#[derive(Default)]
pub struct QueueCallbacks {
    pub on_start: Option<Box<dyn Fn(&SessionIds) + Send + Sync>>,
    pub on_command_executed: Option<Box<dyn Fn(u64, &Value) + Send + Sync>>,
    pub on_session_end: Option<Box<dyn Fn(&Value) + Send + Sync>>,
    pub on_queue_empty: Option<Box<dyn Fn() + Send + Sync>>,
}

struct QueueState {
    next_id: AtomicU64,
    records: Mutex<VecDeque<QueueItemRecord>>,
    pending: AtomicU64,
    disabled: AtomicBool,
    processing: AtomicBool,
    callbacks: Mutex<QueueCallbacks>,
    current_session: Mutex<Option<SessionIds>>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            records: Mutex::new(VecDeque::new()),
            pending: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            callbacks: Mutex::new(QueueCallbacks::default()),
            current_session: Mutex::new(None),
        }
    }

    fn push_record(&self, record: QueueItemRecord) {
        let mut records = self.records.lock().unwrap();
        records.push_back(record);
        while records.len() > RETAINED_RECORDS {
            records.pop_front();
        }
    }

    fn mark(&self, id: u64, status: &str, error: Option<String>) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            let now = chrono::Utc::now().timestamp_millis();
            match status {
                "running" => record.started_at = Some(now),
                _ => record.ended_at = Some(now),
            }
            record.status = status.to_string();
            record.error = error;
        }
    }
}

/// Single-consumer FIFO serializing start/execute/end against one session
/// engine. The consumer task is the sole owner of the engine; nothing else
/// ever touches session state.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<(u64, QueueRequest)>,
    state: Arc<QueueState>,
}

impl CommandQueue {
    /// Spawn the consumer. `config` is the template every new session engine
    /// is built from.
    pub fn spawn(config: EngineConfig, frames: FrameTopic) -> Self {
        let state = Arc::new(QueueState::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx: tx.clone(),
            state: state.clone(),
        };
        tokio::spawn(consumer_loop(rx, state, config, frames, queue.clone()));
        queue
    }

    /// Enqueue a request; returns its item id. Never blocks.
    pub fn enqueue(&self, request: QueueRequest) -> u64 {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.push_record(QueueItemRecord {
            id,
            kind: request.kind().to_string(),
            payload: request.payload(),
            status: "queued".to_string(),
            queued_at: chrono::Utc::now().timestamp_millis(),
            started_at: None,
            ended_at: None,
            error: None,
        });
        self.state.pending.fetch_add(1, Ordering::Relaxed);
        if self.tx.send((id, request)).is_err() {
            self.state.mark(id, "failed", Some("queue consumer gone".to_string()));
        }
        id
    }

    pub fn set_callbacks(&self, callbacks: QueueCallbacks) {
        *self.state.callbacks.lock().unwrap() = callbacks;
    }

    /// Snapshot for observers: retained records plus consumer flags.
    pub fn status(&self) -> Value {
        let records = self.state.records.lock().unwrap();
        let session = self
            .state
            .current_session
            .lock()
            .unwrap()
            .as_ref()
            .map(|ids| ids.key());
        json!({
            "items": records.iter().cloned().collect::<Vec<_>>(),
            "pending": self.state.pending.load(Ordering::Relaxed),
            "processing": self.state.processing.load(Ordering::Relaxed),
            "disabled": self.state.disabled.load(Ordering::Relaxed),
            "session": session,
        })
    }
}

async fn consumer_loop(
    mut rx: mpsc::UnboundedReceiver<(u64, QueueRequest)>,
    state: Arc<QueueState>,
    config: EngineConfig,
    frames: FrameTopic,
    queue: CommandQueue,
) {
    let mut engine: Option<SessionEngine> = None;
    let mut watchdog: Option<JoinHandle<()>> = None;

    while let Some((id, request)) = rx.recv().await {
        state.pending.fetch_sub(1, Ordering::Relaxed);

        // A failed dispatch latches the queue shut for everything except
        // `end`, which is always allowed to reclaim resources.
        if state.disabled.load(Ordering::Relaxed) && !matches!(request, QueueRequest::End { .. })
        {
            state.mark(id, "skipped", Some("queue disabled after failure".to_string()));
            continue;
        }

        state.processing.store(true, Ordering::Relaxed);
        state.mark(id, "running", None);

        match request {
            QueueRequest::Start {
                url,
                client_id,
                test_id,
                session_id,
                total_commands,
            } => {
                if engine.is_some() {
                    warn!("start requested while a session is active");
                    state.mark(id, "failed", Some("session already active".to_string()));
                    state.processing.store(false, Ordering::Relaxed);
                    continue;
                }
                let ids = match session_id {
                    Some(session_id) => SessionIds::new(&client_id, &test_id, &session_id),
                    None => SessionIds::generated(&client_id, &test_id),
                };
                info!(session = %ids.key(), "queue: starting session");

                let mut session_config = config.clone();
                // Interactive sessions skip recording unless the operator
                // turned video processing on explicitly.
                if ids.interactive() && !config.process_video {
                    session_config.record_video = false;
                }

                let activity = ActivityTracker::new();
                let mut new_engine = SessionEngine::new(
                    ids.clone(),
                    &url,
                    session_config,
                    frames.clone(),
                    activity.clone(),
                    total_commands,
                );
                match new_engine.initialize().await {
                    Ok(result) => {
                        *state.current_session.lock().unwrap() = Some(new_engine.ids().clone());
                        if let Some(cb) = &state.callbacks.lock().unwrap().on_start {
                            cb(&ids);
                        }
                        engine = Some(new_engine);
                        watchdog = Some(spawn_inactivity_watchdog(activity, queue.clone()));
                        let failed = result["success"] == json!(false)
                            && result["isNavigationTimeout"] != json!(true);
                        state.mark(id, if failed { "failed" } else { "done" }, None);
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        error!(error = %message, "session initialization failed");
                        let _ = new_engine.quick_end().await;
                        state.mark(id, "failed", Some(message));
                        state.disabled.store(true, Ordering::Relaxed);
                    }
                }
            }
            QueueRequest::Execute { command } => {
                let Some(active) = engine.as_mut() else {
                    state.mark(id, "failed", Some("no active session".to_string()));
                    state.processing.store(false, Ordering::Relaxed);
                    continue;
                };
                let output = active.execute(command).await;
                let index = active.command_counter().saturating_sub(1);
                if let Some(cb) = &state.callbacks.lock().unwrap().on_command_executed {
                    cb(index, &output);
                }
                if active.is_failed() {
                    // Hard dispatch failure: drop everything still queued.
                    let message = output["error"].as_str().unwrap_or("dispatch failed");
                    state.mark(id, "failed", Some(message.to_string()));
                    state.disabled.store(true, Ordering::Relaxed);
                    while let Ok((stale_id, _)) = rx.try_recv() {
                        state.pending.fetch_sub(1, Ordering::Relaxed);
                        state.mark(stale_id, "skipped", Some("queue cleared".to_string()));
                    }
                } else {
                    state.mark(id, "done", None);
                }
            }
            QueueRequest::End {
                quick_cleanup,
                auto_inactivity,
            } => {
                if let Some(handle) = watchdog.take() {
                    handle.abort();
                }
                match engine.take() {
                    Some(mut active) => {
                        if auto_inactivity {
                            active.set_phase("auto_end_inactivity");
                        }
                        let result = if quick_cleanup {
                            active.quick_end().await
                        } else {
                            active.end(false).await
                        };
                        match result {
                            Ok(summary) => {
                                if let Some(cb) = &state.callbacks.lock().unwrap().on_session_end {
                                    cb(&summary);
                                }
                                state.mark(id, "done", None);
                            }
                            Err(e) => {
                                let message = format!("{e:#}");
                                error!(error = %message, "session end failed");
                                state.mark(id, "failed", Some(message));
                            }
                        }
                    }
                    None => {
                        state.mark(id, "failed", Some("no active session".to_string()));
                    }
                }
                *state.current_session.lock().unwrap() = None;
                // A completed end leaves the queue ready for a new session.
                state.disabled.store(false, Ordering::Relaxed);
            }
        }

        state.processing.store(false, Ordering::Relaxed);
        if state.pending.load(Ordering::Relaxed) == 0 {
            if let Some(cb) = &state.callbacks.lock().unwrap().on_queue_empty {
                cb();
            }
        }
    }
}

/// One-shot inactivity guard: when the session sits idle past the limit, an
/// `end` is enqueued on its behalf.
fn spawn_inactivity_watchdog(activity: ActivityTracker, queue: CommandQueue) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if activity.idle_for() >= INACTIVITY_LIMIT {
                warn!("session idle past limit, auto-ending");
                queue.enqueue(QueueRequest::End {
                    quick_cleanup: false,
                    auto_inactivity: true,
                });
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: u64) -> QueueItemRecord {
        QueueItemRecord {
            id,
            kind: "execute".to_string(),
            payload: json!({"command": [":click"]}),
            status: "queued".to_string(),
            queued_at: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    #[test]
    fn record_retention_caps_at_fifty() {
        let state = QueueState::new();
        for id in 0..80 {
            state.push_record(item(id));
        }
        let records = state.records.lock().unwrap();
        assert_eq!(records.len(), RETAINED_RECORDS);
        assert_eq!(records.front().unwrap().id, 30);
        assert_eq!(records.back().unwrap().id, 79);
    }

    #[test]
    fn mark_transitions_are_recorded() {
        let state = QueueState::new();
        state.push_record(item(1));
        state.mark(1, "running", None);
        state.mark(1, "failed", Some("boom".to_string()));
        let records = state.records.lock().unwrap();
        let record = records.front().unwrap();
        assert_eq!(record.status, "failed");
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn request_payloads_serialize() {
        let request = QueueRequest::Execute {
            command: vec![json!(":click")],
        };
        assert_eq!(request.kind(), "execute");
        assert_eq!(request.payload()["command"], json!([":click"]));
    }
}
