//! # Prometheus Metrics
//!
//! Counters for engine activity, registered in a dedicated
//! [`prometheus::Registry`] under the `sharevault` prefix so an embedding
//! process can expose them next to its own.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::config::METRICS_NAMESPACE;

/// Holds all metric handles for one engine instance.
///
/// Cheap to clone; prometheus handles are reference counted.
#[derive(Clone)]
pub struct VaultMetrics {
    registry: Registry,
    /// Deposits committed.
    pub deposits_total: IntCounter,
    /// Assets deposited, smallest units.
    pub assets_deposited_total: IntCounter,
    /// Withdrawal requests filed.
    pub withdraw_requests_total: IntCounter,
    /// Withdrawals settled, manager withdrawals included.
    pub withdrawals_settled_total: IntCounter,
    /// Assets paid out, smallest units.
    pub assets_withdrawn_total: IntCounter,
    /// Withdrawal requests cancelled.
    pub withdraw_cancellations_total: IntCounter,
    /// Operations rejected, labelled by operation.
    pub rejections_total: IntCounterVec,
    /// Failed oracle reads.
    pub oracle_failures_total: IntCounter,
}

impl VaultMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some(METRICS_NAMESPACE.into()), None)
            .expect("failed to create prometheus registry");

        let deposits_total = counter(&registry, "deposits_total", "Deposits committed");
        let assets_deposited_total = counter(
            &registry,
            "assets_deposited_total",
            "Assets deposited in smallest units",
        );
        let withdraw_requests_total = counter(
            &registry,
            "withdraw_requests_total",
            "Withdrawal requests filed",
        );
        let withdrawals_settled_total = counter(
            &registry,
            "withdrawals_settled_total",
            "Withdrawals settled, including manager withdrawals",
        );
        let assets_withdrawn_total = counter(
            &registry,
            "assets_withdrawn_total",
            "Assets paid out in smallest units",
        );
        let withdraw_cancellations_total = counter(
            &registry,
            "withdraw_cancellations_total",
            "Withdrawal requests cancelled",
        );
        let oracle_failures_total =
            counter(&registry, "oracle_failures_total", "Failed pricing oracle reads");

        let rejections_total = IntCounterVec::new(
            Opts::new("rejections_total", "Operations rejected, by operation"),
            &["operation"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(rejections_total.clone()))
            .expect("metric registration");

        Self {
            registry,
            deposits_total,
            assets_deposited_total,
            withdraw_requests_total,
            withdrawals_settled_total,
            assets_withdrawn_total,
            withdraw_cancellations_total,
            rejections_total,
            oracle_failures_total,
        }
    }

    /// Counts a rejected `operation`.
    pub fn reject(&self, operation: &str) {
        self.rejections_total.with_label_values(&[operation]).inc();
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for VaultMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric creation");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration");
    metric
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_prefixed_counters() {
        let metrics = VaultMetrics::new();
        metrics.deposits_total.inc();
        metrics.reject("deposit");

        let text = metrics.encode().unwrap();
        assert!(text.contains("sharevault_deposits_total 1"));
        assert!(text.contains("sharevault_rejections_total{operation=\"deposit\"} 1"));
    }

    #[test]
    fn instances_do_not_share_state() {
        let a = VaultMetrics::new();
        let b = VaultMetrics::new();
        a.withdraw_requests_total.inc();
        assert_eq!(b.withdraw_requests_total.get(), 0);
    }
}
