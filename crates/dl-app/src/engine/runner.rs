use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use dl_core::ports::{ClockPort, RestartPort};
use dl_core::{ChangeId, State, StateError, Status, Task, TaskId};

use super::{TaskError, TaskHandler, TaskOutcome};
use crate::state::StateHandle;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot checkpoint state: {0}")]
    Checkpoint(#[source] anyhow::Error),
}

/// What a pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub done: usize,
    pub retried: usize,
    pub failed: usize,
    pub undone: usize,
    pub cleaned: usize,
}

enum Step {
    Do(TaskId, String),
    Undo(TaskId, String),
    Unhandled(TaskId, String),
}

pub struct TaskRunner {
    state: StateHandle,
    clock: Arc<dyn ClockPort>,
    restart: Arc<dyn RestartPort>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRunner {
    pub fn new(state: StateHandle, clock: Arc<dyn ClockPort>, restart: Arc<dyn RestartPort>) -> Self {
        Self {
            state,
            clock,
            restart,
            handlers: HashMap::new(),
        }
    }

    pub fn add_handler(&mut self, kind: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Runs tasks until nothing is runnable right now.
    ///
    /// A task that asks for a retry is not dispatched again within the
    /// same pass, even when its delay is zero.
    pub async fn run_pass(&self) -> Result<PassSummary, EngineError> {
        let span = info_span!("engine.run_pass");
        async {
            let mut summary = PassSummary::default();
            let mut retried: HashSet<TaskId> = HashSet::new();

            while let Some(step) = self.next_step(&retried).await {
                match step {
                    Step::Do(id, kind) => {
                        self.dispatch_do(&id, &kind, &mut summary, &mut retried)
                            .await?
                    }
                    Step::Undo(id, kind) => self.dispatch_undo(&id, &kind, &mut summary).await?,
                    Step::Unhandled(id, kind) => {
                        let err = TaskError::Internal(format!("no handler for task kind {kind:?}"));
                        let mut st = self.state.lock().await;
                        self.fail_task(&mut st, &id, &err.to_string())?;
                        summary.failed += 1;
                    }
                }
                self.checkpoint().await?;
            }

            self.run_cleanups(&mut summary).await?;
            if summary != PassSummary::default() {
                debug!(?summary, "task runner pass finished");
            }
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn next_step(&self, retried: &HashSet<TaskId>) -> Option<Step> {
        let st = self.state.lock().await;
        let graph = st.graph();

        for change in graph.changes() {
            for id in change.task_ids.iter().rev() {
                let Some(task) = graph.task(id) else { continue };
                if task.status == Status::Undo && self.undo_ready(&st, task) {
                    return Some(Step::Undo(task.id.clone(), task.kind.clone()));
                }
            }
        }

        let now = self.clock.now_ms();
        for change in graph.changes() {
            for id in &change.task_ids {
                let Some(task) = graph.task(id) else { continue };
                if task.status != Status::Do || retried.contains(id) {
                    continue;
                }
                if task.at_time_ms.map(|at| at > now).unwrap_or(false) {
                    continue;
                }
                let deps_done = task.wait_for.iter().all(|dep| {
                    graph
                        .task(dep)
                        .map(|t| t.status == Status::Done)
                        .unwrap_or(false)
                });
                if !deps_done {
                    continue;
                }
                if !self.knows(&task.kind) {
                    return Some(Step::Unhandled(task.id.clone(), task.kind.clone()));
                }
                return Some(Step::Do(task.id.clone(), task.kind.clone()));
            }
        }
        None
    }

    /// A task is undone only after everything that waited for it settled.
    fn undo_ready(&self, st: &State, task: &Task) -> bool {
        let graph = st.graph();
        graph.halt_tasks(&task.id).iter().all(|waiter| {
            let Some(waiter) = graph.task(waiter) else {
                return true;
            };
            match waiter.status {
                Status::Doing | Status::Undo | Status::Undoing => false,
                Status::Done => !self.has_undo(&waiter.kind),
                _ => true,
            }
        })
    }

    fn has_undo(&self, kind: &str) -> bool {
        self.handlers
            .get(kind)
            .map(|h| h.has_undo())
            .unwrap_or(false)
    }

    async fn dispatch_do(
        &self,
        id: &TaskId,
        kind: &str,
        summary: &mut PassSummary,
        retried: &mut HashSet<TaskId>,
    ) -> Result<(), EngineError> {
        let Some(handler) = self.handlers.get(kind).cloned() else {
            return Ok(());
        };
        {
            let mut st = self.state.lock().await;
            st.task_mut(id)?.status = Status::Doing;
        }
        self.checkpoint().await?;

        let span = info_span!("engine.task", task = %id, kind = %kind);
        let result = handler.run(id).instrument(span).await;

        let mut st = self.state.lock().await;
        match result {
            Ok(TaskOutcome::Done) => {
                let task = st.task_mut(id)?;
                task.status = Status::Done;
                task.at_time_ms = None;
                summary.done += 1;
                debug!(task = %id, kind = %kind, "task done");
            }
            Ok(TaskOutcome::Retry(delay)) => {
                let at = self.clock.now_ms() + delay.as_millis() as i64;
                let task = st.task_mut(id)?;
                task.status = Status::Do;
                task.at_time_ms = Some(at);
                retried.insert(id.clone());
                summary.retried += 1;
                debug!(task = %id, kind = %kind, delay_ms = delay.as_millis() as u64, "task will be retried");
            }
            Ok(TaskOutcome::DoneWithRestart(restart)) => {
                let task = st.task_mut(id)?;
                task.status = Status::Done;
                task.at_time_ms = None;
                summary.done += 1;
                drop(st);
                info!(task = %id, kind = %kind, restart = %restart, "task requested system restart");
                if let Err(err) = self.restart.request_restart(restart).await {
                    error!(task = %id, error = %err, "cannot request system restart");
                }
            }
            Err(err) => {
                self.fail_task(&mut st, id, &err.to_string())?;
                summary.failed += 1;
            }
        }
        Ok(())
    }

    async fn dispatch_undo(
        &self,
        id: &TaskId,
        kind: &str,
        summary: &mut PassSummary,
    ) -> Result<(), EngineError> {
        let Some(handler) = self.handlers.get(kind).cloned() else {
            return Ok(());
        };
        {
            let mut st = self.state.lock().await;
            st.task_mut(id)?.status = Status::Undoing;
        }
        self.checkpoint().await?;

        let span = info_span!("engine.undo", task = %id, kind = %kind);
        let result = handler.undo(id).instrument(span).await;

        let mut st = self.state.lock().await;
        let task = st.task_mut(id)?;
        match result {
            Ok(()) => {
                task.status = Status::Undone;
                summary.undone += 1;
                debug!(task = %id, kind = %kind, "task undone");
            }
            Err(err) => {
                task.status = Status::Error;
                task.error = Some(err.to_string());
                task.errorf(format!("cannot undo: {err}"));
                summary.failed += 1;
                error!(task = %id, kind = %kind, error = %err, "task undo failed");
            }
        }
        Ok(())
    }

    fn fail_task(&self, st: &mut State, id: &TaskId, message: &str) -> Result<(), EngineError> {
        let task = st.task_mut(id)?;
        task.status = Status::Error;
        task.error = Some(message.to_string());
        task.errorf(message);
        error!(task = %id, kind = %task.kind, error = %message, "task failed");

        if let Some(change) = task.change.clone() {
            self.abort_change(st, &change)?;
        }
        Ok(())
    }

    /// Holds every pending task of the change and schedules undo of the
    /// done ones that can be undone.
    fn abort_change(&self, st: &mut State, change: &ChangeId) -> Result<(), EngineError> {
        let tasks: Vec<(TaskId, Status, String)> = st
            .graph()
            .change_tasks(change)
            .iter()
            .map(|t| (t.id.clone(), t.status, t.kind.clone()))
            .collect();
        for (id, status, kind) in tasks {
            match status {
                Status::Do => st.task_mut(&id)?.status = Status::Hold,
                Status::Done if self.has_undo(&kind) => st.task_mut(&id)?.status = Status::Undo,
                _ => {}
            }
        }
        Ok(())
    }

    async fn run_cleanups(&self, summary: &mut PassSummary) -> Result<(), EngineError> {
        let pending: Vec<(TaskId, String)> = {
            let st = self.state.lock().await;
            let graph = st.graph();
            graph
                .changes()
                .filter(|chg| graph.change_is_ready(&chg.id))
                .flat_map(|chg| graph.change_tasks(&chg.id))
                .filter(|t| !t.clean)
                .map(|t| (t.id.clone(), t.kind.clone()))
                .collect()
        };

        for (id, kind) in pending {
            if let Some(handler) = self.handlers.get(&kind).cloned() {
                if let Err(err) = handler.cleanup(&id).await {
                    warn!(task = %id, kind = %kind, error = %err, "task cleanup failed");
                }
            }
            let mut st = self.state.lock().await;
            st.task_mut(&id)?.clean = true;
            summary.cleaned += 1;
        }
        self.checkpoint().await
    }

    async fn checkpoint(&self) -> Result<(), EngineError> {
        self.state
            .checkpoint()
            .await
            .map_err(EngineError::Checkpoint)
    }
}
