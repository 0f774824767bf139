//! Container runtime seam.
//!
//! The update-safety code never talks to bollard directly. It goes through the
//! [`ContainerRuntime`] trait so the controller and the health monitor can be
//! driven against the real engine ([`docker::DockerRuntime`]) or a scripted
//! runtime in tests.

pub mod docker;
pub mod spec;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bollard::models::HealthStatusEnum;
use serde::{Deserialize, Serialize};

/// Status code the engine answers with when a container is already in the
/// requested state.
const NOT_MODIFIED: u16 = 304;
const NOT_FOUND: u16 = 404;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime responded with status {status_code}: {message}")]
    Response { status_code: u16, message: String },
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Response { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(NOT_FOUND)
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::Response {
                status_code,
                message,
            },
            other => Self::Other(other.to_string()),
        }
    }
}

/// Opaque identity of a container for the duration of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

impl ContainerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

impl AsRef<str> for HealthStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::None => "none",
        }
    }
}

impl From<HealthStatusEnum> for HealthStatus {
    fn from(status: HealthStatusEnum) -> Self {
        match status {
            HealthStatusEnum::HEALTHY => Self::Healthy,
            HealthStatusEnum::UNHEALTHY => Self::Unhealthy,
            HealthStatusEnum::STARTING => Self::Starting,
            HealthStatusEnum::EMPTY | HealthStatusEnum::NONE => Self::None,
        }
    }
}

/// The subset of an inspection the update-safety code looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    /// Name without the engine's leading `/`.
    pub name: String,
    pub running: bool,
    /// `None` when the container has no health object at all.
    pub health: Option<HealthStatus>,
}

impl ContainerState {
    pub fn has_health_check(&self) -> bool {
        !matches!(self.health, None | Some(HealthStatus::None))
    }
}

/// Strip the leading `/` the engine puts in front of container names.
pub fn normalize_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn rename(&self, id: &str, new_name: &str) -> Result<(), RuntimeError>;
}

/// The transition that was requested when the engine answered with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stop,
    Start,
}

impl Transition {
    fn already_markers(self) -> &'static [&'static str] {
        match self {
            Self::Stop => &["not running", "already stopped"],
            Self::Start => &["already started", "already running"],
        }
    }
}

/// Whether `err` only says the container is already in the state the
/// transition asked for.
///
/// The status code is authoritative. Matching on the message is a heuristic
/// for engines and API versions that do not answer with 304, and may stop
/// working if the wording changes.
pub fn is_already_in_state(err: &RuntimeError, transition: Transition) -> bool {
    if err.status_code() == Some(NOT_MODIFIED) {
        return true;
    }
    let message = err.to_string().to_lowercase();
    transition
        .already_markers()
        .iter()
        .any(|marker| message.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn response(status_code: u16, message: &str) -> RuntimeError {
        RuntimeError::Response {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_not_modified_is_already_in_state() {
        assert!(is_already_in_state(&response(304, ""), Transition::Stop));
        assert!(is_already_in_state(&response(304, ""), Transition::Start));
    }

    #[test]
    fn test_message_fallback() {
        let err = RuntimeError::Other("Container abc is not running".to_string());
        assert!(is_already_in_state(&err, Transition::Stop));
        assert!(!is_already_in_state(&err, Transition::Start));

        let err = response(500, "Container ALREADY STARTED");
        assert!(is_already_in_state(&err, Transition::Start));
        assert!(!is_already_in_state(&err, Transition::Stop));
    }

    #[test]
    fn test_real_failures_are_not_tolerated() {
        let err = response(500, "start failed");
        assert!(!is_already_in_state(&err, Transition::Start));
        assert!(!is_already_in_state(&response(404, "no such container"), Transition::Stop));
    }

    #[quickcheck]
    fn prop_already_stopped_any_case_is_tolerated(prefix: String, suffix: String, upper: bool) -> bool {
        let marker = if upper { "ALREADY STOPPED" } else { "already stopped" };
        let err = RuntimeError::Other(format!("{prefix}{marker}{suffix}"));
        is_already_in_state(&err, Transition::Stop)
    }

    #[quickcheck]
    fn prop_non_304_without_marker_is_fatal(status_code: u16, message: String) -> bool {
        let lowered = message.to_lowercase();
        if status_code == 304
            || Transition::Start
                .already_markers()
                .iter()
                .any(|m| lowered.contains(m))
        {
            return true;
        }
        let err = response(status_code, &message);
        // The formatted error also contains the status code; make sure it can
        // never spell out a marker by itself.
        !is_already_in_state(&err, Transition::Start)
    }

    #[test]
    fn test_health_status_mapping() {
        assert_eq!(HealthStatus::from(HealthStatusEnum::HEALTHY), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(HealthStatusEnum::EMPTY), HealthStatus::None);
        assert_eq!(HealthStatus::Unhealthy.as_ref(), "unhealthy");
    }

    #[test]
    fn test_has_health_check() {
        let mut state = ContainerState {
            id: "a".to_string(),
            name: "app".to_string(),
            running: true,
            health: None,
        };
        assert!(!state.has_health_check());
        state.health = Some(HealthStatus::None);
        assert!(!state.has_health_check());
        state.health = Some(HealthStatus::Starting);
        assert!(state.has_health_check());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("/drydock"), "drydock");
        assert_eq!(normalize_name("drydock"), "drydock");
    }
}
