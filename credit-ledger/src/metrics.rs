//! Ledger metrics
//!
//! Each `LedgerMetrics` owns its own registry so multiple ledger
//! instances (or test cases) can coexist in one process without
//! duplicate-registration errors.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, HistogramVec,
    IntCounterVec, Registry,
};

/// Counters and histograms for ledger operations
#[derive(Clone)]
pub struct LedgerMetrics {
    registry: Registry,

    /// Mutations by operation and outcome
    pub operations: IntCounterVec,

    /// Credits moved, by ledger and direction
    pub credits_moved: IntCounterVec,

    /// Mutation latency by operation
    pub operation_duration: HistogramVec,
}

impl LedgerMetrics {
    /// Create metrics on a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let operations = register_int_counter_vec_with_registry!(
            "ledger_operations_total",
            "Ledger mutations by operation and outcome",
            &["operation", "outcome"],
            registry
        )?;

        let credits_moved = register_int_counter_vec_with_registry!(
            "ledger_credits_moved_total",
            "Credits credited or debited, by ledger",
            &["ledger", "direction"],
            registry
        )?;

        let operation_duration = register_histogram_vec_with_registry!(
            "ledger_operation_duration_seconds",
            "Ledger mutation latency",
            &["operation"],
            vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5],
            registry
        )?;

        Ok(Self {
            registry,
            operations,
            credits_moved,
            operation_duration,
        })
    }

    /// The registry backing these metrics, for exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one finished mutation
    pub fn record_operation(&self, operation: &str, outcome: &str, seconds: f64) {
        self.operations.with_label_values(&[operation, outcome]).inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(seconds);
    }

    /// Record credits moving through an account
    pub fn record_credits(&self, ledger: &str, amount: i64) {
        let (direction, magnitude) = if amount >= 0 {
            ("credit", amount)
        } else {
            ("debit", -amount)
        };
        self.credits_moved
            .with_label_values(&[ledger, direction])
            .inc_by(magnitude as u64);
    }
}

impl std::fmt::Debug for LedgerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_instances_coexist() {
        let a = LedgerMetrics::new().unwrap();
        let b = LedgerMetrics::new().unwrap();
        a.record_operation("adjust", "ok", 0.001);
        b.record_operation("adjust", "error", 0.002);

        assert_eq!(a.operations.with_label_values(&["adjust", "ok"]).get(), 1);
        assert_eq!(b.operations.with_label_values(&["adjust", "ok"]).get(), 0);
    }

    #[test]
    fn test_credits_split_by_direction() {
        let metrics = LedgerMetrics::new().unwrap();
        metrics.record_credits("credits", 100);
        metrics.record_credits("credits", -40);

        assert_eq!(
            metrics
                .credits_moved
                .with_label_values(&["credits", "credit"])
                .get(),
            100
        );
        assert_eq!(
            metrics
                .credits_moved
                .with_label_values(&["credits", "debit"])
                .get(),
            40
        );
    }
}
