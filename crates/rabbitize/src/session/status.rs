use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::ids::SessionIds;
use crate::artifacts::ArtifactStore;

/// Live status for external observers, rewritten atomically on every phase
/// transition so pollers never see a torn file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub phase: String,
    /// `active` until the session finishes, then `finished`.
    pub status: String,
    /// Unix epoch milliseconds.
    pub start_time: i64,
    pub last_update: i64,
    pub command_count: u64,
    pub commands_executed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_command_index: Option<u64>,
    pub pid: u32,
    pub hostname: String,
    pub errors: Vec<String>,
    pub video_processing: bool,
    pub client_id: String,
    pub test_id: String,
    pub session_id: String,
    pub initial_url: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_commands: Option<u64>,
}

/// Owns the mutable status and flushes it on every change.
pub struct StatusWriter {
    store: ArtifactStore,
    state: SessionStatus,
}

impl StatusWriter {
    pub fn new(
        store: ArtifactStore,
        ids: &SessionIds,
        initial_url: &str,
        port: u16,
        video_processing: bool,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let state = SessionStatus {
            phase: "created".to_string(),
            status: "active".to_string(),
            start_time: now,
            last_update: now,
            command_count: 0,
            commands_executed: 0,
            current_command: None,
            current_command_index: None,
            pid: std::process::id(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            errors: Vec::new(),
            video_processing,
            client_id: ids.client_id.clone(),
            test_id: ids.test_id.clone(),
            session_id: ids.session_id.clone(),
            initial_url: initial_url.to_string(),
            port,
            total_commands: None,
        };
        Self { store, state }
    }

    pub fn state(&self) -> &SessionStatus {
        &self.state
    }

    pub fn set_total_commands(&mut self, total: Option<u64>) {
        self.state.total_commands = total;
    }

    /// Transition to a new phase and flush. Failures warn; status is for
    /// observers, never a reason to break the session.
    pub fn set_phase(&mut self, phase: &str) {
        self.state.phase = phase.to_string();
        self.flush();
    }

    pub fn command_running(&mut self, index: u64, command: &Value) {
        self.state.current_command = Some(command.to_string());
        self.state.current_command_index = Some(index);
        self.state.command_count = index + 1;
        self.set_phase("executing_command");
    }

    pub fn command_done(&mut self, executed: u64) {
        self.state.commands_executed = executed;
        self.state.current_command = None;
        self.state.current_command_index = None;
        self.set_phase("command_complete");
    }

    pub fn record_error(&mut self, error: &str) {
        self.state.errors.push(error.to_string());
        self.flush();
    }

    /// Final transition: `status` flips to `finished`.
    pub fn finish(&mut self, phase: &str) {
        self.state.status = "finished".to_string();
        self.set_phase(phase);
    }

    fn flush(&mut self) {
        self.state.last_update = chrono::Utc::now().timestamp_millis();
        let path = self.store.status_json();
        if let Err(e) = self.store.write_json_atomic(&path, &self.state) {
            warn!(error = %format!("{e:#}"), "status.json write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &std::path::Path) -> StatusWriter {
        let store = ArtifactStore::at_root(dir.join("s"));
        store.ensure_tree().unwrap();
        let ids = SessionIds::new("c", "t", "s1");
        StatusWriter::new(store, &ids, "https://example.com", 8080, false)
    }

    #[test]
    fn phase_transitions_are_visible_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.set_phase("initializing");

        let raw = std::fs::read_to_string(tmp.path().join("s/status.json")).unwrap();
        let parsed: SessionStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.phase, "initializing");
        assert_eq!(parsed.status, "active");
        assert_eq!(parsed.session_id, "s1");
    }

    #[test]
    fn finish_flips_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.command_running(0, &serde_json::json!([":click"]));
        w.command_done(1);
        w.finish("complete");

        let raw = std::fs::read_to_string(tmp.path().join("s/status.json")).unwrap();
        let parsed: SessionStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.status, "finished");
        assert_eq!(parsed.phase, "complete");
        assert_eq!(parsed.commands_executed, 1);
    }

    #[test]
    fn errors_accumulate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        w.record_error("boom");
        w.record_error("again");
        assert_eq!(w.state().errors.len(), 2);
    }
}
