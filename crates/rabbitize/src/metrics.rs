use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use sysinfo::{Pid, PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt};
use tokio::task::JoinHandle;
use tracing::trace;

/// One resource sample, tagged with whatever command was running.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub cpu_pct: f32,
    pub mem_mb: f64,
    pub elapsed_ms: u64,
    pub current_command: String,
    pub command_index: u64,
    pub command_raw: Value,
}

#[derive(Clone, Debug, Default)]
pub struct CommandTag {
    pub text: String,
    pub index: u64,
    pub raw: Value,
}

/// Process CPU/memory sampling, shared between the 1s ticker and the step
/// loop's explicit pre/post samples. The ticker skips a tick when a sample
/// is already in flight (`try_lock` on the `System`).
pub struct MetricsHub {
    system: Mutex<System>,
    samples: Mutex<Vec<MetricSample>>,
    current: Mutex<CommandTag>,
    started: Instant,
    pid: Pid,
}

impl MetricsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            system: Mutex::new(System::new()),
            samples: Mutex::new(Vec::new()),
            current: Mutex::new(CommandTag::default()),
            started: Instant::now(),
            pid: Pid::from_u32(std::process::id()),
        })
    }

    /// Tag subsequent samples with the running command.
    pub fn set_current(&self, tag: CommandTag) {
        *self.current.lock().unwrap() = tag;
    }

    /// Take one sample now. Skips silently if another sample holds the
    /// `System` (overlapping ticks never queue up).
    pub fn sample_now(&self) {
        let Ok(mut system) = self.system.try_lock() else {
            trace!("metrics tick skipped, sampler busy");
            return;
        };
        system.refresh_process_specifics(self.pid, ProcessRefreshKind::new().with_cpu());
        let Some(process) = system.process(self.pid) else {
            return;
        };
        let tag = self.current.lock().unwrap().clone();
        let sample = MetricSample {
            timestamp: chrono::Utc::now().timestamp_millis(),
            cpu_pct: process.cpu_usage(),
            mem_mb: process.memory() as f64 / (1024.0 * 1024.0),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            current_command: tag.text,
            command_index: tag.index,
            command_raw: tag.raw,
        };
        self.samples.lock().unwrap().push(sample);
    }

    /// Everything sampled so far, for `metrics.json`.
    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples.lock().unwrap().clone()
    }

    /// Spawn the 1s ticker. Abort the returned handle to stop it.
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                hub.sample_now();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_accumulate_with_current_tag() {
        let hub = MetricsHub::new();
        hub.set_current(CommandTag {
            text: ":click".into(),
            index: 3,
            raw: serde_json::json!([":click"]),
        });
        hub.sample_now();
        let samples = hub.samples();
        // The process table should contain our own pid on supported
        // platforms; when it does, the tag must ride along.
        if let Some(s) = samples.first() {
            assert_eq!(s.current_command, ":click");
            assert_eq!(s.command_index, 3);
            assert!(s.elapsed_ms < 60_000);
        }
    }
}
