//! Outcome counters, exported in the Prometheus text format.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::audit::AuditStatus;

/// Write-only counter sink used by the health monitor.
pub trait MetricsSink: Send + Sync {
    fn rollback(&self, container_name: &str, status: AuditStatus);
}

pub struct GuardMetrics {
    registry: Registry,
    rollbacks: IntCounterVec,
    self_update_launches: IntCounterVec,
    acks: IntCounter,
}

impl GuardMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let rollbacks = IntCounterVec::new(
            Opts::new(
                "drydock_rollback_total",
                "Automatic rollbacks attempted by the health monitor",
            ),
            &["container", "status"],
        )?;
        let self_update_launches = IntCounterVec::new(
            Opts::new(
                "drydock_self_update_launch_total",
                "Self-update controllers launched",
            ),
            &["status"],
        )?;
        let acks = IntCounter::new(
            "drydock_self_update_acks_total",
            "Client acknowledgments of self-update notices",
        )?;

        registry.register(Box::new(rollbacks.clone()))?;
        registry.register(Box::new(self_update_launches.clone()))?;
        registry.register(Box::new(acks.clone()))?;

        Ok(Self {
            registry,
            rollbacks,
            self_update_launches,
            acks,
        })
    }

    pub fn self_update_launch(&self, status: AuditStatus) {
        self.self_update_launches
            .with_label_values(&[status.as_ref()])
            .inc();
    }

    pub fn ack(&self) {
        self.acks.inc();
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

impl MetricsSink for GuardMetrics {
    fn rollback(&self, container_name: &str, status: AuditStatus) {
        self.rollbacks
            .with_label_values(&[container_name, status.as_ref()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        let metrics = GuardMetrics::new().unwrap();
        metrics.rollback("web", AuditStatus::Success);
        metrics.rollback("web", AuditStatus::Success);
        metrics.rollback("db", AuditStatus::Error);
        metrics.ack();
        metrics.self_update_launch(AuditStatus::Success);

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"drydock_rollback_total{container="web",status="success"} 2"#));
        assert!(text.contains(r#"drydock_rollback_total{container="db",status="error"} 1"#));
        assert!(text.contains("drydock_self_update_acks_total 1"));
        assert!(text.contains(r#"drydock_self_update_launch_total{status="success"} 1"#));
    }
}
