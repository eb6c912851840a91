use std::collections::{BTreeSet, HashMap, HashSet};

use weft_core::error::GraphError;
use weft_core::graph::validate_tasks;
use weft_core::types::{ProcessKind, Task, TaskId, TaskResult, TaskStatus};

/// The task graph of one run plus its pending set.
///
/// Tasks keep their declaration order; the pending set holds indices into
/// that order so runnable tasks always come out in declaration order.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    pending: BTreeSet<usize>,
    next_seq: u64,
}

impl TaskStore {
    /// Validate and index `tasks`.
    pub fn new(tasks: Vec<Task>, process: ProcessKind) -> Result<Self, GraphError> {
        validate_tasks(&tasks, process)?;
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Ok(Self {
            tasks,
            index,
            pending: BTreeSet::new(),
            next_seq: 0,
        })
    }

    /// A copy with all runtime state cleared, for a fresh run.
    pub fn fresh(&self) -> Self {
        let mut store = self.clone();
        for task in &mut store.tasks {
            task.reset_runtime();
        }
        store.pending.clear();
        store.next_seq = 0;
        store
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.tasks[i]),
            None => None,
        }
    }

    /// Tasks in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Seed the pending set for a workflow run: every start task, plus
    /// every task with dependencies that no edge points at.
    pub fn seed_workflow(&mut self) {
        let targeted: HashSet<&TaskId> = self
            .tasks
            .iter()
            .flat_map(|t| t.references())
            .filter(|(field, _)| matches!(*field, "next_tasks" | "condition"))
            .map(|(_, id)| id)
            .collect();

        let seeds: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.is_start || (!t.dependencies.is_empty() && !targeted.contains(&t.id))
            })
            .map(|(i, _)| i)
            .collect();
        self.pending.extend(seeds);
    }

    /// Add a task to the pending set. Returns false for unknown ids.
    pub fn activate(&mut self, id: &TaskId) -> bool {
        match self.index.get(id) {
            Some(&i) => {
                self.pending.insert(i);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: &TaskId) -> bool {
        self.index
            .get(id)
            .is_some_and(|i| self.pending.contains(i))
    }

    /// A dependency counts once it completed, or once an async dependency
    /// has reported back at all.
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| match self.get(dep) {
            Some(d) => {
                d.status == TaskStatus::Completed
                    || (d.async_execution && d.status == TaskStatus::Failed)
            }
            None => false,
        })
    }

    pub fn is_runnable(&self, id: &TaskId) -> bool {
        match self.index.get(id) {
            Some(&i) => self.runnable_at(i),
            None => false,
        }
    }

    fn runnable_at(&self, i: usize) -> bool {
        let task = &self.tasks[i];
        self.pending.contains(&i)
            && task.status == TaskStatus::NotStarted
            && self.dependencies_satisfied(task)
    }

    /// Pending tasks whose dependencies are satisfied, in declaration order.
    pub fn runnable(&self) -> Vec<TaskId> {
        self.pending
            .iter()
            .copied()
            .filter(|&i| self.runnable_at(i))
            .map(|i| self.tasks[i].id.clone())
            .collect()
    }

    /// Move a task to `InProgress`. Returns the attempt number.
    pub fn mark_in_progress(&mut self, id: &TaskId) -> u32 {
        let Some(&i) = self.index.get(id) else {
            return 0;
        };
        self.pending.remove(&i);
        let task = &mut self.tasks[i];
        task.status = TaskStatus::InProgress;
        task.attempts += 1;
        task.attempts
    }

    pub fn complete(&mut self, id: &TaskId, result: TaskResult) {
        let seq = self.next_seq;
        if let Some(task) = self.get_mut(id) {
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            task.error = None;
            task.validation_feedback = None;
            task.completed_seq = Some(seq);
            self.next_seq += 1;
        }
    }

    pub fn fail(&mut self, id: &TaskId, error: impl Into<String>) {
        if let Some(task) = self.get_mut(id) {
            task.status = TaskStatus::Failed;
            task.result = None;
            task.error = Some(error.into());
            task.validation_feedback = None;
            task.completed_seq = None;
        }
    }

    /// Put a finished task back to `NotStarted`, discarding its result.
    pub fn reset(&mut self, id: &TaskId) {
        if let Some(task) = self.get_mut(id) {
            task.status = TaskStatus::NotStarted;
            task.result = None;
            task.error = None;
            task.completed_seq = None;
        }
    }

    pub fn in_progress(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect()
    }
}
