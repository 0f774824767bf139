//! Health-gated auto-rollback.
//!
//! After a container has been updated it is watched for a bounded window. The
//! first `unhealthy` verdict inside the window reverts it to the newest backup
//! image. Reaching the end of the window without such a verdict promotes the
//! update silently.
//!
//! Each monitor is one task owning its poll ticker and its window timer, so
//! every terminal transition drops both at once. Failures never leave the
//! task: they end up in the audit log and the rollback counter.

pub mod lifecycle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::audit::{AuditAction, AuditRecord, AuditSink, AuditStatus};
use crate::metrics::MetricsSink;
use crate::runtime::{ContainerRef, ContainerRuntime, HealthStatus, RuntimeError, normalize_name};
use crate::store::{BackupRecord, BackupStore, StoreError};
use lifecycle::ContainerLifecycle;

pub struct HealthMonitorOptions {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub container: ContainerRef,
    /// Tag the container runs since the update, i.e. the version a rollback
    /// moves away from.
    pub current_tag: String,
    pub window: Duration,
    pub interval: Duration,
    pub lifecycle: Arc<dyn ContainerLifecycle>,
    pub backups: Arc<dyn BackupStore>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The container has no health check; there is nothing to gate on.
    NoHealthCheck,
    /// The window ended without an unhealthy verdict.
    Expired,
    RolledBack { to_tag: String },
    /// Unhealthy, but no backup to go back to.
    RollbackSkipped,
    RollbackFailed(String),
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
enum RollbackError {
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("backup store: {0}")]
    Store(#[from] StoreError),
    #[error("container {0} not found")]
    NotFound(String),
}

/// Handle on a running monitor.
///
/// Dropping the handle leaves the monitor running.
pub struct MonitorHandle {
    container: ContainerRef,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<MonitorOutcome>>,
    outcome: Option<MonitorOutcome>,
}

impl MonitorHandle {
    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    /// Stop the monitor. Safe to call any number of times, before or after
    /// it finished on its own.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Wait for the terminal outcome. `None` if the task panicked.
    pub async fn outcome(&mut self) -> Option<MonitorOutcome> {
        if let Some(task) = self.task.take() {
            self.outcome = task.await.ok();
        }
        self.outcome.clone()
    }
}

pub fn start_health_monitor(options: HealthMonitorOptions) -> MonitorHandle {
    let (cancel, cancel_rx) = watch::channel(false);
    let container = options.container.clone();
    info!(
        "Monitoring health of {} for {:?} (every {:?})",
        container.name, options.window, options.interval
    );
    let task = tokio::spawn(HealthMonitor { options }.run(cancel_rx));
    MonitorHandle {
        container,
        cancel,
        task: Some(task),
        outcome: None,
    }
}

/// Resolves once cancellation was requested. Never resolves if the handle is
/// gone without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct HealthMonitor {
    options: HealthMonitorOptions,
}

impl HealthMonitor {
    async fn run(self, mut cancel_rx: watch::Receiver<bool>) -> MonitorOutcome {
        let name = &self.options.container.name;
        let window = tokio::time::sleep(self.options.window);
        tokio::pin!(window);

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.options.interval, self.options.interval);
        // A check still in flight swallows the ticks it overlaps.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let inspected = tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => {
                    debug!("Health monitor for {name} cancelled");
                    return MonitorOutcome::Cancelled;
                }
                _ = &mut window => return self.expire(),
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel_rx) => {
                            debug!("Health monitor for {name} cancelled");
                            return MonitorOutcome::Cancelled;
                        }
                        _ = &mut window => return self.expire(),
                        inspected = self.options.runtime.inspect(&self.options.container.id) => inspected,
                    }
                }
            };

            match inspected {
                Ok(state) => match state.health {
                    None | Some(HealthStatus::None) => {
                        info!("Container {name} has no health check, stopping health monitor");
                        return MonitorOutcome::NoHealthCheck;
                    }
                    Some(HealthStatus::Unhealthy) => {
                        info!("Container {name} reported unhealthy, rolling back");
                        return self.roll_back().await;
                    }
                    Some(status) => debug!("Container {name} health: {}", status.as_ref()),
                },
                Err(e) => warn!("Failed to inspect container {name}: {e}"),
            }
        }
    }

    fn expire(&self) -> MonitorOutcome {
        // Only the absence of an unhealthy verdict was observed here; a
        // container stuck in `starting` ends up on this path too.
        info!(
            "Container {} is healthy after {:?}, stopping health monitor",
            self.options.container.name, self.options.window
        );
        MonitorOutcome::Expired
    }

    async fn roll_back(&self) -> MonitorOutcome {
        let name = &self.options.container.name;

        let backups = match self.options.backups.backups_for(name).await {
            Ok(backups) => backups,
            Err(e) => return self.rollback_failed(None, RollbackError::from(e)).await,
        };
        let Some(backup) = backups.into_iter().next() else {
            warn!("No backup available for {name}, cannot roll back");
            return MonitorOutcome::RollbackSkipped;
        };

        match self.restore(&backup).await {
            Ok(()) => {
                info!(
                    "Rolled back {name} from {} to {}",
                    self.options.current_tag, backup.image_tag
                );
                let record = AuditRecord::new(AuditAction::Rollback, name, AuditStatus::Success)
                    .versions(
                        Some(self.options.current_tag.clone()),
                        Some(backup.image_tag.clone()),
                    )
                    .details(format!("unhealthy after update, restored {}", backup.image_ref()));
                self.finish(record, AuditStatus::Success).await;
                MonitorOutcome::RolledBack {
                    to_tag: backup.image_tag,
                }
            }
            Err(e) => self.rollback_failed(Some(&backup), e).await,
        }
    }

    async fn restore(&self, backup: &BackupRecord) -> Result<(), RollbackError> {
        let container = &self.options.container;
        let lifecycle = &self.options.lifecycle;

        let handle = lifecycle
            .current_container(container)
            .await?
            .ok_or_else(|| RollbackError::NotFound(container.name.clone()))?;
        let spec = lifecycle.inspect_container(&handle).await?;
        lifecycle
            .stop_and_remove_container(&handle, &spec, container)
            .await?;
        lifecycle
            .recreate_container(&spec, &backup.image_ref(), container)
            .await?;
        Ok(())
    }

    async fn rollback_failed(
        &self,
        backup: Option<&BackupRecord>,
        err: RollbackError,
    ) -> MonitorOutcome {
        let name = &self.options.container.name;
        let message = err.to_string();
        error!("Rollback of {name} failed: {message}");

        let record = AuditRecord::new(AuditAction::Rollback, name, AuditStatus::Error)
            .versions(
                Some(self.options.current_tag.clone()),
                backup.map(|b| b.image_tag.clone()),
            )
            .details(message.clone());
        self.finish(record, AuditStatus::Error).await;
        MonitorOutcome::RollbackFailed(message)
    }

    async fn finish(&self, record: AuditRecord, status: AuditStatus) {
        if let Err(e) = self.options.audit.record(record).await {
            warn!(
                "Failed to write rollback audit record for {}: {e}",
                self.options.container.name
            );
        }
        self.options
            .metrics
            .rollback(&self.options.container.name, status);
    }
}

/// Monitors currently running, one per container name.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`, cancelling any monitor already watching the same name.
    pub async fn insert(&self, handle: MonitorHandle) {
        let mut monitors = self.monitors.lock().await;
        monitors.retain(|_, h| !h.is_finished());
        if let Some(previous) = monitors.insert(handle.container().name.clone(), handle) {
            previous.cancel();
        }
    }

    /// Cancel the monitor for `container`, given by name or by (short) id.
    /// Returns whether one was tracked.
    pub async fn cancel(&self, container: &str) -> bool {
        let container = normalize_name(container);
        if container.is_empty() {
            return false;
        }
        let mut monitors = self.monitors.lock().await;
        let key = if monitors.contains_key(container) {
            Some(container.to_string())
        } else {
            monitors
                .iter()
                .find(|(_, h)| h.container().id.starts_with(container))
                .map(|(name, _)| name.clone())
        };
        match key.and_then(|name| monitors.remove(&name)) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        for (_, handle) in self.monitors.lock().await.drain() {
            handle.cancel();
        }
    }

    pub async fn len(&self) -> usize {
        let mut monitors = self.monitors.lock().await;
        monitors.retain(|_, h| !h.is_finished());
        monitors.len()
    }
}
