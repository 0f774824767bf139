//! The environment contract between the orchestrator and the controller
//! process.
//!
//! The controller runs in a container of its own, started by the orchestrator
//! right before the orchestrator's container is replaced. Everything it needs
//! is passed through these variables.

use std::num::ParseIntError;
use std::time::Duration;

use crate::runtime::ContainerRef;

pub const OLD_CONTAINER_ID: &str = "OLD_CONTAINER_ID";
pub const OLD_CONTAINER_NAME: &str = "OLD_CONTAINER_NAME";
pub const NEW_CONTAINER_ID: &str = "NEW_CONTAINER_ID";
pub const OP_ID: &str = "OP_ID";
pub const START_TIMEOUT_MS: &str = "START_TIMEOUT_MS";
pub const HEALTH_TIMEOUT_MS: &str = "HEALTH_TIMEOUT_MS";
pub const POLL_INTERVAL_MS: &str = "POLL_INTERVAL_MS";
pub const CONTRACT_VERSION_VAR: &str = "SELF_UPDATE_CONTRACT_VERSION";
pub const AUDIT_LOG_PATH: &str = "AUDIT_LOG_PATH";

pub const CONTRACT_VERSION: u32 = 1;

/// Name of the orchestrator's own container when none is configured.
pub const DEFAULT_SELF_CONTAINER_NAME: &str = "drydock";
pub const DEFAULT_OP_ID: &str = "unknown";
pub const DEFAULT_START_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum EnvContractError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),
    #[error("environment variable {var} has invalid value {value:?}: {source}")]
    Invalid {
        var: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("environment variable {var} must be greater than zero")]
    Zero { var: &'static str },
    #[error("unsupported self-update contract version {0} (expected {CONTRACT_VERSION})")]
    UnsupportedVersion(String),
}

/// One self-update, as handed over to the controller process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOperation {
    pub op_id: String,
    pub old: ContainerRef,
    pub candidate_id: String,
    pub start_timeout: Duration,
    pub health_timeout: Duration,
    pub poll_interval: Duration,
}

impl UpdateOperation {
    pub fn from_env() -> Result<Self, EnvContractError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the operation from any variable source. Empty values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvContractError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(version) = get(CONTRACT_VERSION_VAR) {
            if version.trim() != CONTRACT_VERSION.to_string() {
                return Err(EnvContractError::UnsupportedVersion(version));
            }
        }

        let old_id = get(OLD_CONTAINER_ID).ok_or(EnvContractError::Missing(OLD_CONTAINER_ID))?;
        let candidate_id =
            get(NEW_CONTAINER_ID).ok_or(EnvContractError::Missing(NEW_CONTAINER_ID))?;
        let old_name =
            get(OLD_CONTAINER_NAME).unwrap_or_else(|| DEFAULT_SELF_CONTAINER_NAME.to_string());
        let op_id = get(OP_ID).unwrap_or_else(|| DEFAULT_OP_ID.to_string());

        let millis = |var: &'static str, default: u64| -> Result<Duration, EnvContractError> {
            let ms = match get(var) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map_err(|source| EnvContractError::Invalid {
                        var,
                        value: value.clone(),
                        source,
                    })?,
                None => default,
            };
            if ms == 0 {
                return Err(EnvContractError::Zero { var });
            }
            Ok(Duration::from_millis(ms))
        };

        Ok(Self {
            op_id,
            old: ContainerRef::new(old_id, old_name),
            candidate_id,
            start_timeout: millis(START_TIMEOUT_MS, DEFAULT_START_TIMEOUT_MS)?,
            health_timeout: millis(HEALTH_TIMEOUT_MS, DEFAULT_HEALTH_TIMEOUT_MS)?,
            poll_interval: millis(POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)?,
        })
    }

    /// The variables that reproduce this operation in the controller process.
    pub fn to_env(&self) -> Vec<String> {
        vec![
            format!("{CONTRACT_VERSION_VAR}={CONTRACT_VERSION}"),
            format!("{OP_ID}={}", self.op_id),
            format!("{OLD_CONTAINER_ID}={}", self.old.id),
            format!("{OLD_CONTAINER_NAME}={}", self.old.name),
            format!("{NEW_CONTAINER_ID}={}", self.candidate_id),
            format!("{START_TIMEOUT_MS}={}", self.start_timeout.as_millis()),
            format!("{HEALTH_TIMEOUT_MS}={}", self.health_timeout.as_millis()),
            format!("{POLL_INTERVAL_MS}={}", self.poll_interval.as_millis()),
        ]
    }
}
