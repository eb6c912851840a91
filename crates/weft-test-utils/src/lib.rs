//! Mocks and fixtures shared by the weft test suites.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{Agent, TaskObserver};
use weft_core::types::{
    AgentOutput, AgentRequest, DecisionSpec, Task, TaskEvent, TaskId, TaskStatus,
};

/// Shared record of agent calls. Several agents can share one log to see a
/// global start/end ordering.
#[derive(Debug, Default)]
pub struct CallLog {
    requests: Mutex<Vec<AgentRequest>>,
    events: Mutex<Vec<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn begin(&self, request: &AgentRequest) {
        self.requests.lock().unwrap().push(request.clone());
        self.events
            .lock()
            .unwrap()
            .push(format!("start:{}", request.task_name));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self, task_name: &str) {
        self.events.lock().unwrap().push(format!("end:{task_name}"));
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, task_name: &str) -> Vec<AgentRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.task_name == task_name)
            .collect()
    }

    pub fn calls(&self, task_name: &str) -> usize {
        self.requests_for(task_name).len()
    }

    /// `start:<task>` / `end:<task>` markers in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn position(&self, marker: &str) -> Option<usize> {
        self.events().iter().position(|e| e == marker)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a CallLog);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable agent.
///
/// Responses are queued per task name; the last one repeats. Tasks without
/// a script answer `"<task> done"`.
pub struct MockAgent {
    id: String,
    role: String,
    scripts: Mutex<HashMap<String, VecDeque<AgentOutput>>>,
    failures: HashSet<String>,
    panics: HashSet<String>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
    log: Arc<CallLog>,
}

impl MockAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: String::new(),
            scripts: Mutex::new(HashMap::new()),
            failures: HashSet::new(),
            panics: HashSet::new(),
            delays: HashMap::new(),
            default_delay: None,
            log: CallLog::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Share a call log with other agents.
    pub fn with_log(mut self, log: Arc<CallLog>) -> Self {
        self.log = log;
        self
    }

    pub fn respond<I, S>(self, task_name: &str, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.respond_with(task_name, outputs.into_iter().map(AgentOutput::text))
    }

    pub fn respond_with(
        self,
        task_name: &str,
        outputs: impl IntoIterator<Item = AgentOutput>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_name.to_string(), outputs.into_iter().collect());
        self
    }

    pub fn fail_on(mut self, task_name: &str) -> Self {
        self.failures.insert(task_name.to_string());
        self
    }

    pub fn panic_on(mut self, task_name: &str) -> Self {
        self.panics.insert(task_name.to_string());
        self
    }

    pub fn delay(mut self, task_name: &str, delay: Duration) -> Self {
        self.delays.insert(task_name.to_string(), delay);
        self
    }

    pub fn delay_all(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn log(&self) -> Arc<CallLog> {
        self.log.clone()
    }

    fn next_output(&self, task_name: &str) -> AgentOutput {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(task_name) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => AgentOutput::text(format!("{task_name} done")),
        }
    }
}

impl Agent for MockAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn execute(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutput>> {
        Box::pin(async move {
            self.log.begin(&request);
            let _guard = InFlight(&self.log);
            let name = request.task_name.as_str();

            let delay = self.delays.get(name).copied().or(self.default_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.panics.contains(name) {
                panic!("mock agent {} panicked on {}", self.id, name);
            }
            let result = if self.failures.contains(name) {
                Err(WeftError::agent(&self.id, format!("scripted failure on {name}")))
            } else {
                Ok(self.next_output(name))
            };
            self.log.end(name);
            result
        })
    }
}

/// Observer that keeps every event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(task name, status)` per event, in order.
    pub fn summary(&self) -> Vec<(String, TaskStatus)> {
        self.events()
            .into_iter()
            .map(|e| (e.task_name, e.status))
            .collect()
    }
}

impl TaskObserver for RecordingObserver {
    fn on_task_finished(&self, event: &TaskEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Tasks named after their ids, each depending on nothing.
pub fn tasks(names: &[&str]) -> Vec<Task> {
    names.iter().map(|n| Task::new(*n, *n)).collect()
}

/// `write` (start) -> `check` (decision): `valid` ends, `invalid` loops
/// back to `write`.
pub fn validation_loop(max_retries: u32) -> Vec<Task> {
    vec![
        Task::new("write", "write")
            .start()
            .with_max_retries(max_retries)
            .then(vec!["check".into()]),
        Task::new("check", "check").decision(
            DecisionSpec::new()
                .terminate_on("valid")
                .on("invalid", vec![TaskId::from("write")]),
        ),
    ]
}

/// Write `contents` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// A temporary directory holding one file.
pub fn temp_file(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), name, contents);
    (dir, path)
}
