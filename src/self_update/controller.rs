//! Blue/green swap of the orchestrator's own container.
//!
//! The forward path is a fixed sequence of phases. The first failing phase
//! ends it; the rollback then runs every one of its steps, and the error that
//! is reported is always the one from the forward path.

use std::fmt;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::Instant;

use super::env::UpdateOperation;
use crate::audit::{AuditAction, AuditRecord, AuditSink, AuditStatus};
use crate::runtime::{
    ContainerRuntime, ContainerState, HealthStatus, RuntimeError, Transition, is_already_in_state,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StopOld,
    WaitOldStopped,
    StartNew,
    WaitNewRunning,
    HealthGate,
    Commit,
    Rollback,
    Failed,
    Done,
}

impl AsRef<str> for Phase {
    fn as_ref(&self) -> &str {
        match self {
            Self::StopOld => "STOP_OLD",
            Self::WaitOldStopped => "WAIT_OLD_STOPPED",
            Self::StartNew => "START_NEW",
            Self::WaitNewRunning => "WAIT_NEW_RUNNING",
            Self::HealthGate => "HEALTH_GATE",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelfUpdateError {
    #[error("{phase} failed: {source}")]
    Runtime {
        phase: Phase,
        #[source]
        source: RuntimeError,
    },
    #[error("{phase} timed out after {timeout:?} waiting for container {container_id}")]
    Timeout {
        phase: Phase,
        container_id: String,
        timeout: Duration,
    },
    #[error("container {container_id} reported unhealthy")]
    Unhealthy { container_id: String },
}

impl SelfUpdateError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Runtime { phase, .. } | Self::Timeout { phase, .. } => *phase,
            Self::Unhealthy { .. } => Phase::HealthGate,
        }
    }
}

/// `[self-update:<opId>] <PHASE>[ - <details>]`
pub fn phase_line(op_id: &str, phase: Phase, details: Option<&str>) -> String {
    match details {
        Some(details) => format!("[self-update:{op_id}] {phase} - {details}"),
        None => format!("[self-update:{op_id}] {phase}"),
    }
}

enum Wait {
    Done,
    Pending,
}

pub struct SelfUpdateController<'a> {
    op: &'a UpdateOperation,
    runtime: &'a dyn ContainerRuntime,
    audit: Option<&'a dyn AuditSink>,
}

impl<'a> SelfUpdateController<'a> {
    pub fn new(op: &'a UpdateOperation, runtime: &'a dyn ContainerRuntime) -> Self {
        Self {
            op,
            runtime,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: &'a dyn AuditSink) -> Self {
        self.audit = Some(audit);
        self
    }

    fn log(&self, phase: Phase, details: Option<&str>) {
        info!("{}", phase_line(&self.op.op_id, phase, details));
    }

    /// Run the operation to its terminal state: the candidate committed, or
    /// the old container restored.
    pub async fn execute(&self) -> Result<(), SelfUpdateError> {
        let result = match self.forward().await {
            Ok(()) => {
                self.commit().await;
                self.log(Phase::Done, None);
                Ok(())
            }
            Err(err) => {
                let details = err.to_string();
                error!("{}", phase_line(&self.op.op_id, Phase::Failed, Some(&details)));
                self.rollback().await;
                Err(err)
            }
        };
        self.audit(&result).await;
        result
    }

    async fn forward(&self) -> Result<(), SelfUpdateError> {
        self.stop_old().await?;
        self.wait_old_stopped().await?;
        self.start_new().await?;
        self.wait_new_running().await?;
        self.health_gate().await?;
        Ok(())
    }

    async fn stop_old(&self) -> Result<(), SelfUpdateError> {
        self.log(Phase::StopOld, Some(&self.op.old.id));
        match self.runtime.stop(&self.op.old.id).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_in_state(&e, Transition::Stop) => {
                self.log(Phase::StopOld, Some("already stopped"));
                Ok(())
            }
            Err(source) => Err(SelfUpdateError::Runtime {
                phase: Phase::StopOld,
                source,
            }),
        }
    }

    async fn wait_old_stopped(&self) -> Result<(), SelfUpdateError> {
        self.log(Phase::WaitOldStopped, Some(&self.op.old.id));
        self.wait_until(
            Phase::WaitOldStopped,
            &self.op.old.id,
            self.op.start_timeout,
            Instant::now(),
            None,
            |state| if state.running { Ok(Wait::Pending) } else { Ok(Wait::Done) },
        )
        .await
    }

    async fn start_new(&self) -> Result<(), SelfUpdateError> {
        self.log(Phase::StartNew, Some(&self.op.candidate_id));
        match self.runtime.start(&self.op.candidate_id).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_in_state(&e, Transition::Start) => {
                self.log(Phase::StartNew, Some("already started"));
                Ok(())
            }
            Err(source) => Err(SelfUpdateError::Runtime {
                phase: Phase::StartNew,
                source,
            }),
        }
    }

    async fn wait_new_running(&self) -> Result<(), SelfUpdateError> {
        self.log(Phase::WaitNewRunning, Some(&self.op.candidate_id));
        self.wait_until(
            Phase::WaitNewRunning,
            &self.op.candidate_id,
            self.op.start_timeout,
            Instant::now(),
            None,
            |state| if state.running { Ok(Wait::Done) } else { Ok(Wait::Pending) },
        )
        .await
    }

    async fn health_gate(&self) -> Result<(), SelfUpdateError> {
        let candidate = &self.op.candidate_id;
        let started = Instant::now();
        let state = self
            .inspect_before(Phase::HealthGate, candidate, self.op.health_timeout, started)
            .await?;

        if !state.has_health_check() {
            self.log(Phase::HealthGate, Some("no health check configured, skipping"));
            return Ok(());
        }

        self.log(Phase::HealthGate, Some(candidate));
        self.wait_until(
            Phase::HealthGate,
            candidate,
            self.op.health_timeout,
            started,
            Some(state),
            |state| match state.health {
                Some(HealthStatus::Healthy) => Ok(Wait::Done),
                Some(HealthStatus::Unhealthy) => Err(SelfUpdateError::Unhealthy {
                    container_id: state.id.clone(),
                }),
                _ => Ok(Wait::Pending),
            },
        )
        .await
    }

    /// Inspect `container_id`, giving up once `timeout` has passed since
    /// `started`. A hanging engine call counts against the phase deadline.
    async fn inspect_before(
        &self,
        phase: Phase,
        container_id: &str,
        timeout: Duration,
        started: Instant,
    ) -> Result<ContainerState, SelfUpdateError> {
        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, self.runtime.inspect(container_id)).await {
            Ok(result) => result.map_err(|source| SelfUpdateError::Runtime { phase, source }),
            Err(_) => Err(SelfUpdateError::Timeout {
                phase,
                container_id: container_id.to_string(),
                timeout,
            }),
        }
    }

    /// Poll `container_id` until `check` is done or `timeout` of wall-clock
    /// time has passed since `started`. `first` is checked before polling.
    async fn wait_until<F>(
        &self,
        phase: Phase,
        container_id: &str,
        timeout: Duration,
        started: Instant,
        mut first: Option<ContainerState>,
        check: F,
    ) -> Result<(), SelfUpdateError>
    where
        F: Fn(&ContainerState) -> Result<Wait, SelfUpdateError>,
    {
        loop {
            let state = match first.take() {
                Some(state) => state,
                None => {
                    self.inspect_before(phase, container_id, timeout, started)
                        .await?
                }
            };

            if let Wait::Done = check(&state)? {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(SelfUpdateError::Timeout {
                    phase,
                    container_id: container_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.op.poll_interval.min(timeout - elapsed)).await;
        }
    }

    async fn commit(&self) {
        self.log(Phase::Commit, Some(&self.op.old.id));
        // The candidate is live at this point, so a leftover old container
        // does not undo the commit.
        if let Err(e) = self.runtime.remove(&self.op.old.id, true).await {
            warn!(
                "{}",
                phase_line(
                    &self.op.op_id,
                    Phase::Commit,
                    Some(&format!("failed to remove old container: {e}"))
                )
            );
        }
    }

    async fn rollback(&self) {
        let op_id = &self.op.op_id;
        let old = &self.op.old;
        let candidate = &self.op.candidate_id;

        self.log(Phase::Rollback, Some(&format!("removing candidate {candidate}")));
        if let Err(e) = self.runtime.remove(candidate, true).await {
            warn!(
                "{}",
                phase_line(op_id, Phase::Rollback, Some(&format!("failed to remove candidate: {e}")))
            );
        }

        match self.runtime.inspect(&old.id).await {
            Ok(state) if state.name != old.name => {
                self.log(
                    Phase::Rollback,
                    Some(&format!("renaming {} back to {}", state.name, old.name)),
                );
                if let Err(e) = self.runtime.rename(&old.id, &old.name).await {
                    warn!(
                        "{}",
                        phase_line(op_id, Phase::Rollback, Some(&format!("failed to restore name: {e}")))
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                "{}",
                phase_line(op_id, Phase::Rollback, Some(&format!("failed to inspect old container: {e}")))
            ),
        }

        self.log(Phase::Rollback, Some(&format!("starting old container {}", old.id)));
        match self.runtime.start(&old.id).await {
            Ok(()) => {}
            Err(e) if is_already_in_state(&e, Transition::Start) => {}
            Err(e) => error!(
                "{}",
                phase_line(op_id, Phase::Rollback, Some(&format!("failed to start old container: {e}")))
            ),
        }
    }

    async fn audit(&self, result: &Result<(), SelfUpdateError>) {
        let Some(audit) = self.audit else {
            return;
        };
        let record = match result {
            Ok(()) => AuditRecord::new(AuditAction::SelfUpdate, &self.op.old.name, AuditStatus::Success),
            Err(err) => AuditRecord::new(AuditAction::SelfUpdate, &self.op.old.name, AuditStatus::Error)
                .details(err.to_string()),
        }
        .versions(Some(self.op.old.id.clone()), Some(self.op.candidate_id.clone()));

        if let Err(e) = audit.record(record).await {
            warn!("Failed to write self-update audit record: {e}");
        }
    }
}
