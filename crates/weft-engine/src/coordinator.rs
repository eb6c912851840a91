use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weft_core::error::Result;
use weft_core::types::{TaskId, TaskResult};

/// Ticket for one submitted execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsyncHandle {
    pub task_id: TaskId,
    seq: u64,
}

#[derive(Debug)]
pub enum AsyncOutcome {
    Completed(TaskResult),
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
pub struct AsyncCompletion {
    pub handle: AsyncHandle,
    pub outcome: AsyncOutcome,
}

/// Runs async task executions off the control loop.
///
/// Each submission is spawned onto the runtime and holds a semaphore permit
/// while it runs, so at most `max_concurrency` agent calls are in flight.
/// Completions that arrive while the caller waits on other handles are
/// buffered and handed out later.
pub struct AsyncCoordinator {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    running: FuturesUnordered<BoxFuture<'static, AsyncCompletion>>,
    aborts: HashMap<AsyncHandle, AbortHandle>,
    buffered: VecDeque<AsyncCompletion>,
    next_seq: u64,
}

impl AsyncCoordinator {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            cancel: CancellationToken::new(),
            running: FuturesUnordered::new(),
            aborts: HashMap::new(),
            buffered: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Spawn `fut` and return immediately.
    pub fn submit<F>(&mut self, task_id: TaskId, fut: F) -> AsyncHandle
    where
        F: Future<Output = Result<TaskResult>> + Send + 'static,
    {
        let handle = AsyncHandle {
            task_id,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let join = tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return None,
                },
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = fut => Some(result),
            }
        });

        self.aborts.insert(handle.clone(), join.abort_handle());
        let h = handle.clone();
        self.running.push(
            async move {
                let outcome = match join.await {
                    Ok(Some(Ok(result))) => AsyncOutcome::Completed(result),
                    Ok(Some(Err(e))) => AsyncOutcome::Failed(e.to_string()),
                    Ok(None) => AsyncOutcome::Cancelled,
                    Err(e) if e.is_cancelled() => AsyncOutcome::Cancelled,
                    Err(e) => {
                        warn!(task_id = %h.task_id, error = %e, "Async task panicked");
                        AsyncOutcome::Failed(format!("agent panicked: {e}"))
                    }
                };
                AsyncCompletion { handle: h, outcome }
            }
            .boxed(),
        );
        debug!(task_id = %handle.task_id, in_flight = self.running.len(), "Async task submitted");
        handle
    }

    /// Submissions not yet handed back to the caller.
    pub fn in_flight(&self) -> usize {
        self.running.len() + self.buffered.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Completions available right now, without waiting.
    pub fn poll_completed(&mut self) -> Vec<AsyncCompletion> {
        let mut done: Vec<AsyncCompletion> = self.buffered.drain(..).collect();
        while let Some(Some(completion)) = self.running.next().now_or_never() {
            done.push(completion);
        }
        for c in &done {
            self.aborts.remove(&c.handle);
        }
        done
    }

    /// Wait for the next completion. `None` when nothing is in flight.
    pub async fn next_completed(&mut self) -> Option<AsyncCompletion> {
        let completion = match self.buffered.pop_front() {
            Some(c) => Some(c),
            None => self.running.next().await,
        };
        if let Some(c) = &completion {
            self.aborts.remove(&c.handle);
        }
        completion
    }

    /// Wait for exactly `handles`, in the order given. Other completions
    /// that arrive meanwhile are buffered. Unknown handles are skipped.
    pub async fn join(&mut self, handles: &[AsyncHandle]) -> Vec<AsyncCompletion> {
        let mut wanted: HashSet<&AsyncHandle> = handles
            .iter()
            .filter(|h| self.aborts.contains_key(*h))
            .collect();
        let mut found: HashMap<AsyncHandle, AsyncCompletion> = HashMap::new();

        let mut keep = VecDeque::new();
        for c in self.buffered.drain(..) {
            if wanted.remove(&c.handle) {
                found.insert(c.handle.clone(), c);
            } else {
                keep.push_back(c);
            }
        }
        self.buffered = keep;

        while !wanted.is_empty() {
            let Some(c) = self.running.next().await else {
                break;
            };
            if wanted.remove(&c.handle) {
                found.insert(c.handle.clone(), c);
            } else {
                self.buffered.push_back(c);
            }
        }

        let mut out = Vec::with_capacity(found.len());
        for h in handles {
            if let Some(c) = found.remove(h) {
                self.aborts.remove(h);
                out.push(c);
            }
        }
        out
    }

    /// Cancel everything outstanding and wait for each handle to resolve.
    pub async fn cancel_all(&mut self) -> Vec<AsyncCompletion> {
        self.cancel.cancel();
        for abort in self.aborts.values() {
            abort.abort();
        }
        let mut done: Vec<AsyncCompletion> = self.buffered.drain(..).collect();
        while let Some(c) = self.running.next().await {
            done.push(c);
        }
        self.aborts.clear();
        if !done.is_empty() {
            debug!(count = done.len(), "Async tasks cancelled");
        }
        done
    }
}
