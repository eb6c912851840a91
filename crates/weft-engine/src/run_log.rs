use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::EventBus;
use weft_core::types::{TaskEvent, TaskStatus};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per finished task
/// to `{log_dir}/{run_id}.jsonl`, flushing after every line.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    task_id: String,
    task_name: String,
    attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = failed and retry-exhausted tasks,
    /// 2 = every task.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write events for `run_id` until cancelled or the bus closes.
    /// Events already queued when cancellation arrives are still written.
    pub async fn run(self, event_bus: Arc<EventBus>, run_id: String, cancel: CancellationToken) {
        let mut rx = event_bus.subscribe();
        self.run_with(&mut rx, run_id, cancel).await;
    }

    /// Like [`run`](Self::run), with a receiver subscribed beforehand so no
    /// early event is missed.
    pub async fn run_with(
        self,
        rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
        run_id: String,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id != run_id {
                                continue;
                            }
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a task event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &TaskEvent) -> Option<LogEntry> {
        let failed = event.status == TaskStatus::Failed;
        if self.level < 2 && !failed && !event.retry_exhausted {
            return None;
        }

        let event_type = match event.status {
            TaskStatus::Failed => "task_failed",
            TaskStatus::Completed if event.result.as_ref().is_some_and(|r| r.skipped) => {
                "task_skipped"
            }
            TaskStatus::Completed => "task_completed",
            TaskStatus::NotStarted | TaskStatus::InProgress => "task_updated",
        };

        let mut detail = serde_json::Map::new();
        if let Some(result) = &event.result {
            detail.insert("output_preview".into(), truncate_str(&result.raw, 200).into());
            detail.insert("elapsed_ms".into(), result.elapsed_ms.into());
            if let Some(agent) = &result.agent_id {
                detail.insert("agent".into(), agent.clone().into());
            }
        }
        if let Some(err) = &event.error {
            detail.insert("error".into(), err.clone().into());
        }
        if event.retry_exhausted {
            detail.insert("retry_exhausted".into(), true.into());
        }

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id.clone(),
            event_type: event_type.to_string(),
            task_id: event.task_id.to_string(),
            task_name: event.task_name.clone(),
            attempt: event.attempt,
            detail: (!detail.is_empty()).then_some(serde_json::Value::Object(detail)),
        })
    }
}

/// Truncate a string for logging on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
