use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dl_core::ports::{HookError, HookRequest, RestartKind};
use dl_core::TaskId;

use super::{task_data, DeviceManager};
use crate::engine::{TaskError, TaskOutcome};

const BUSY_RETRY: Duration = Duration::from_secs(60);

/// Data of a `run-hook` task, under `hook-setup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HookSetup {
    pub snap: String,
    pub hook: String,
    /// A missing optional hook is not an error.
    #[serde(default)]
    pub optional: bool,
}

impl DeviceManager {
    pub(super) async fn do_run_hook(&self, task: &TaskId) -> Result<TaskOutcome, TaskError> {
        let (setup, restart_task): (HookSetup, Option<TaskId>) = {
            let st = self.state.lock().await;
            (
                task_data(&st, task, "hook-setup")?,
                st.task(task)?.get("restart-task")?,
            )
        };

        let present = self
            .deps
            .hooks
            .has_hook(&setup.snap, &setup.hook)
            .await
            .map_err(TaskError::failed)?;
        if !present {
            if setup.optional {
                self.task_log(task, format!("Skipping missing {} hook", setup.hook))
                    .await?;
                return Ok(TaskOutcome::Done);
            }
            return Err(TaskError::failed(format!(
                "snap {:?} has no {:?} hook",
                setup.snap, setup.hook
            )));
        }

        let request = HookRequest::new(&setup.snap, &setup.hook);
        let output = match self
            .deps
            .hooks
            .run_hook(&request, self.options.hook_timeout)
            .await
        {
            Ok(output) => output,
            Err(HookError::Busy(reason)) => {
                self.task_log(task, format!("Hook runner busy, will retry: {reason}"))
                    .await?;
                return Ok(TaskOutcome::Retry(BUSY_RETRY));
            }
            Err(err) => return Err(TaskError::failed(err)),
        };

        let mut st = self.state.lock().await;
        if let Some(mode) = output.context.get("restart-mode") {
            let kind = match mode {
                Value::String(s) => s.parse::<RestartKind>().map_err(TaskError::failed)?,
                other => {
                    return Err(TaskError::failed(format!(
                        "invalid restart-mode {other} set by {} hook",
                        setup.hook
                    )))
                }
            };
            if let Some(restart_task) = &restart_task {
                st.task_mut(restart_task)?.set("restart-mode", &kind)?;
            }
        }
        st.task_mut(task)?
            .logf(format!("Ran {} hook of snap {:?}", setup.hook, setup.snap));
        Ok(TaskOutcome::Done)
    }
}
