//! The daemon loop: `ensure` on a slow timer, the task runner on a fast one.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use dl_app::{DeviceManager, DeviceManagerOptions, PassSummary, StateHandle, TaskRunner};
use dl_core::config::DaemonConfig;
use dl_core::ports::RestartPort;

use super::wiring::wire_dependencies;

/// Wake-up period of the task runner, so retried tasks are picked up
/// without waiting for the next ensure.
const RUN_PASS_INTERVAL: Duration = Duration::from_secs(5);

pub struct Daemon {
    manager: DeviceManager,
    runner: TaskRunner,
    state: StateHandle,
    restart: Arc<dyn RestartPort>,
    ensure_interval: Duration,
}

impl Daemon {
    pub async fn build(config: &DaemonConfig) -> anyhow::Result<Self> {
        let deps = wire_dependencies(config)?;
        let state = StateHandle::load(deps.state_store).await?;
        let clock = deps.manager.clock.clone();
        let restart = deps.manager.restart.clone();

        let manager = DeviceManager::new(
            deps.manager,
            state.clone(),
            DeviceManagerOptions {
                preseed: config.preseed,
                hook_timeout: Duration::from_secs(config.hook_timeout_secs),
            },
        )
        .await?;
        let mut runner = TaskRunner::new(state.clone(), clock, restart.clone());
        manager.register_handlers(&mut runner);
        info!(
            ensure_interval_secs = config.ensure_interval_secs,
            "daemon ready"
        );

        Ok(Self {
            manager,
            runner,
            state,
            restart,
            ensure_interval: Duration::from_secs(config.ensure_interval_secs.max(1)),
        })
    }

    /// One ensure pass followed by a runner pass. Errors are logged, the
    /// loop keeps going.
    pub async fn ensure_and_run(&self) {
        if let Err(err) = self.manager.ensure().await {
            warn!(error = %err, "ensure failed");
        }
        self.run_pass().await;
    }

    async fn run_pass(&self) {
        match self.runner.run_pass().await {
            Ok(summary) if summary != PassSummary::default() => info!(?summary, "task runner pass"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "task runner pass failed"),
        }
    }

    /// Runs until a restart was requested or the process is interrupted,
    /// then checkpoints the state.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut ensure_tick = interval(self.ensure_interval);
        ensure_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut runner_tick = interval(RUN_PASS_INTERVAL);
        runner_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ensure_tick.tick() => self.ensure_and_run().await,
                _ = runner_tick.tick() => self.run_pass().await,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, stopping");
                    break;
                }
            }
            if let Some(kind) = self.restart.pending() {
                info!(%kind, "restart pending, stopping");
                break;
            }
        }

        self.state.checkpoint().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> DaemonConfig {
        let root = dir.path();
        DaemonConfig {
            state_file: root.join("state.json"),
            seed_dir: root.join("seed"),
            boot_dir: root.join("boot"),
            hooks_dir: root.join("hooks"),
            assertions_dir: root.join("assertions"),
            keys_dir: root.join("keys"),
            remodel_snaps_dir: root.join("remodel-snaps"),
            cloud_init_dir: root.join("cloud"),
            save_dir: root.join("save"),
            target_dir: root.join("target"),
            reboot_command: vec![],
            ..DaemonConfig::defaults()
        }
    }

    #[tokio::test]
    async fn daemon_builds_over_an_empty_system() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let daemon = Daemon::build(&config).await.unwrap();
        daemon.ensure_and_run().await;
        daemon.state.checkpoint().await.unwrap();

        assert!(daemon.restart.pending().is_none());
    }
}
