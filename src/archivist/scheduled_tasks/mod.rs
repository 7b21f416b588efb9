use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod tasks;

pub use tasks::{HarvestKind, HarvestTask, Harvester};

use super::Archivist;
use crate::ArchivistError;

/// Trait for implementing scheduled background tasks.
///
/// Each task waits its initial delay, runs, then runs again every interval until the
/// scheduler shuts down. Implementations should be idempotent: a failed run is logged and
/// simply retried at the next tick.
#[async_trait]
pub trait Task: Send + Sync {
    /// Returns the unique name of this task for logging and identification.
    fn name(&self) -> &'static str;

    /// Delay before the first run.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Returns the interval between task executions.
    fn interval(&self) -> Duration;

    async fn execute(&self, archivist: &Archivist) -> Result<(), ArchivistError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Runs registered tasks, each in its own loop.
pub struct Scheduler {
    config: SchedulerConfig,
    tasks: Vec<Arc<dyn Task>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
        }
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.push(task);
    }

    /// Spawns one loop per task. Nothing is spawned when the scheduler is disabled.
    pub fn start(self, archivist: Archivist) -> SchedulerHandle {
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        if !self.config.enabled {
            tracing::info!(target: "archivist::scheduler::start", "Scheduler disabled");
            return SchedulerHandle {
                shutdown: shutdown_sender,
                handles: Vec::new(),
            };
        }

        let handles = self
            .tasks
            .into_iter()
            .map(|task| {
                tracing::debug!(
                    target: "archivist::scheduler::start",
                    "Starting task {} (every {:?})",
                    task.name(),
                    task.interval()
                );
                tokio::spawn(run_task_loop(
                    task,
                    archivist.clone(),
                    shutdown_receiver.clone(),
                ))
            })
            .collect();

        SchedulerHandle {
            shutdown: shutdown_sender,
            handles,
        }
    }
}

/// Stops the scheduled tasks. Dropping the handle stops them too, at their next wake-up.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every task loop to stop and waits for them. A run in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(target: "archivist::scheduler::shutdown", "Task loop ended abnormally: {}", e);
            }
        }
        tracing::debug!(target: "archivist::scheduler::shutdown", "Scheduler stopped");
    }
}

async fn run_task_loop(
    task: Arc<dyn Task>,
    archivist: Archivist,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(task.initial_delay()) => {}
        _ = shutdown.changed() => return,
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        run_once(task.as_ref(), &archivist).await;

        tokio::select! {
            _ = tokio::time::sleep(task.interval()) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!(target: "archivist::scheduler::run", "Task {} stopped", task.name());
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs the task once. Errors and panics stop here so they never reach other tasks.
/// Returns whether the run succeeded.
pub(crate) async fn run_once(task: &dyn Task, archivist: &Archivist) -> bool {
    match AssertUnwindSafe(task.execute(archivist)).catch_unwind().await {
        Ok(Ok(())) => {
            tracing::debug!(target: "archivist::scheduler::run", "Task {} completed", task.name());
            true
        }
        Ok(Err(e)) => {
            tracing::warn!(target: "archivist::scheduler::run", "Task {} failed: {}", task.name(), e);
            false
        }
        Err(payload) => {
            tracing::error!(
                target: "archivist::scheduler::run",
                "Task {} panicked: {}",
                task.name(),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}
