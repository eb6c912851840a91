//! Workflow strategy: general graph execution from the start tasks.

use tracing::debug;

use super::run::{guarded, ProcessRun, Selection};

impl ProcessRun<'_> {
    pub(super) async fn run_workflow(&mut self) {
        self.store.seed_workflow();

        while self.halt.is_none() {
            for completion in self.coordinator.poll_completed() {
                self.apply_completion(completion);
            }

            let runnable = self.store.runnable();
            if runnable.is_empty() {
                if self.coordinator.is_idle() {
                    break;
                }
                match guarded(self.coordinator.next_completed(), self.deadline, &self.cancel).await {
                    Ok(Some(completion)) => self.apply_completion(completion),
                    Ok(None) => break,
                    Err(halt) => self.set_halt(halt),
                }
                continue;
            }

            debug!(runnable = runnable.len(), in_flight = self.coordinator.in_flight(), "Workflow pass");
            for id in runnable {
                // An earlier task in this pass may have re-routed this one.
                if !self.store.is_runnable(&id) {
                    continue;
                }
                let agent = match self.select_agent(&id).await {
                    Selection::Agent(agent) => agent,
                    Selection::Settled => continue,
                    Selection::Halted => break,
                };
                let include_input = self.store.get(&id).is_some_and(|t| t.is_start);
                let context = match self.store.get(&id) {
                    Some(task) => self.context.build(task, &self.store, include_input),
                    None => continue,
                };
                if !self.dispatch(&id, agent, context).await {
                    break;
                }
            }
        }
    }
}
