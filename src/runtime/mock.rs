//! Scripted in-memory runtime for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerRuntime, ContainerState, HealthStatus, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Inspect(String),
    Start(String),
    Stop(String),
    Remove { id: String, force: bool },
    Rename { id: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Inspect,
    Start,
    Stop,
    Remove,
    Rename,
}

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: String,
    pub running: bool,
    /// Health reported by successive inspections; the last entry sticks.
    pub health: VecDeque<Option<HealthStatus>>,
    /// When false, `start` succeeds without the container ever running.
    pub start_takes_effect: bool,
    /// When false, `stop` succeeds without the container ever stopping.
    pub stop_takes_effect: bool,
}

impl MockContainer {
    pub fn new(name: &str, running: bool) -> Self {
        Self {
            name: name.to_string(),
            running,
            health: VecDeque::from([None]),
            start_takes_effect: true,
            stop_takes_effect: true,
        }
    }

    pub fn with_health(mut self, health: &[Option<HealthStatus>]) -> Self {
        self.health = health.iter().copied().collect();
        self
    }
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, MockContainer>,
    /// Failure injected once the given number of calls succeeded.
    failures: HashMap<(Op, String), (usize, RuntimeError)>,
    counts: HashMap<(Op, String), usize>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct MockRuntime {
    inner: Mutex<Inner>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, id: &str, container: MockContainer) -> Self {
        self.inner
            .lock()
            .unwrap()
            .containers
            .insert(id.to_string(), container);
        self
    }

    /// Every call of `op` against `id` fails with `err`.
    pub fn fail(self, op: Op, id: &str, err: RuntimeError) -> Self {
        self.fail_after(op, id, 0, err)
    }

    /// The first `succeed` calls of `op` against `id` go through, every later
    /// one fails with `err`.
    pub fn fail_after(self, op: Op, id: &str, succeed: usize, err: RuntimeError) -> Self {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert((op, id.to_string()), (succeed, err));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls other than inspections, in order.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Inspect(_)))
            .collect()
    }

    pub fn inspections_of(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Inspect(i) if i == id))
            .count()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        self.inner.lock().unwrap().containers.get(id).cloned()
    }

    fn record(&self, op: Op, id: &str, call: Call) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        let key = (op, id.to_string());
        let count = inner.counts.entry(key.clone()).or_default();
        let previous = *count;
        *count += 1;
        match inner.failures.get(&key) {
            Some((succeed, err)) if previous >= *succeed => Err(clone_error(err)),
            _ => Ok(()),
        }
    }
}

fn clone_error(err: &RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::Response {
            status_code,
            message,
        } => RuntimeError::Response {
            status_code: *status_code,
            message: message.clone(),
        },
        RuntimeError::Unavailable(m) => RuntimeError::Unavailable(m.clone()),
        RuntimeError::Other(m) => RuntimeError::Other(m.clone()),
    }
}

fn no_such_container(id: &str) -> RuntimeError {
    RuntimeError::Response {
        status_code: 404,
        message: format!("No such container: {id}"),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.record(Op::Inspect, id, Call::Inspect(id.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| no_such_container(id))?;
        let health = if container.health.len() > 1 {
            container.health.pop_front().flatten()
        } else {
            container.health.front().copied().flatten()
        };
        Ok(ContainerState {
            id: id.to_string(),
            name: container.name.clone(),
            running: container.running,
            health,
        })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Op::Start, id, Call::Start(id.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| no_such_container(id))?;
        if container.start_takes_effect {
            container.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(Op::Stop, id, Call::Stop(id.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| no_such_container(id))?;
        if container.stop_takes_effect {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(
            Op::Remove,
            id,
            Call::Remove {
                id: id.to_string(),
                force,
            },
        )?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| no_such_container(id))
    }

    async fn rename(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.record(
            Op::Rename,
            id,
            Call::Rename {
                id: id.to_string(),
                name: new_name.to_string(),
            },
        )?;
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| no_such_container(id))?;
        container.name = new_name.to_string();
        Ok(())
    }
}
