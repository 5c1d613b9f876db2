//! Helpers shared by the integration tests: stub workers written as sh scripts.
#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;

use tomato_desk_lib::config::WorkerConfig;
use tomato_desk_lib::events::ShellEvent;

pub const WORKER_SCRIPT: &str = "worker.sh";

/// Readiness line in the format the Flask dev server prints.
pub fn ready_line(port: u16) -> String {
    format!(" * Running on http://127.0.0.1:{port}")
}

/// Write `body` as the worker entry point under `dir` and return a config
/// launching it with `sh`.
pub fn stub_worker(dir: &Path, body: &str) -> WorkerConfig {
    std::fs::write(dir.join(WORKER_SCRIPT), body).unwrap();
    WorkerConfig {
        program: "sh".to_string(),
        entry: WORKER_SCRIPT.into(),
        readiness_timeout_ms: 5000,
        stop_grace_ms: 500,
        request_timeout_secs: 5,
        ..WorkerConfig::default()
    }
}

/// A worker that prints the readiness marker after `delay` and then idles.
pub fn ready_after(dir: &Path, delay: &str, port: u16) -> WorkerConfig {
    let script = format!(
        "sleep {delay}\necho '{}'\nexec sleep 30\n",
        ready_line(port)
    );
    WorkerConfig {
        port,
        ..stub_worker(dir, &script)
    }
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<ShellEvent>, pred: F) -> ShellEvent
where
    F: Fn(&ShellEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn is_stopped(event: &ShellEvent) -> bool {
    matches!(event, ShellEvent::WorkerStopped { .. })
}
