use prometheus::{histogram_opts, opts, HistogramTimer, HistogramVec, IntCounterVec, Registry};

use crate::AppError;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "llmos_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .expect("static histogram definition");
        let failures = IntCounterVec::new(
            opts!("llmos_operator_reconciliation_errors_total", "reconciliation errors"),
            &["kind", "error"],
        )
        .expect("static counter definition");
        let reconciliations = IntCounterVec::new(
            opts!("llmos_operator_reconciliations_total", "reconciliations"),
            &["kind"],
        )
        .expect("static counter definition");
        Metrics { reconciliations, failures, reconcile_duration }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, kind: &str, e: &AppError) {
        self.failures.with_label_values(&[kind, e.metric_label().as_ref()]).inc()
    }

    /// Count a reconcile and time it until the returned timer is dropped.
    pub fn count_and_measure(&self, kind: &str) -> HistogramTimer {
        self.reconciliations.with_label_values(&[kind]).inc();
        self.reconcile_duration.with_label_values(&[kind]).start_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_reconciles_and_failures_per_kind() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();

        drop(metrics.count_and_measure("DatasetVersion"));
        metrics.reconcile_failure(
            "DatasetVersion",
            &AppError::UnknownPhase { phase: "Bogus".into() },
        );

        assert_eq!(metrics.reconciliations.with_label_values(&["DatasetVersion"]).get(), 1);
        assert_eq!(
            metrics.failures.with_label_values(&["DatasetVersion", "unknown_phase"]).get(),
            1
        );
        assert_eq!(registry.gather().len(), 3);
    }
}
