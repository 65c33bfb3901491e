use klbrd_trace::error::TraceableError;
use kube::{core::ApiResource, Resource, ResourceExt};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use tokio::time::Instant;

use crate::crd::phase::Phase;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub failed_attempts: IntGaugeVec,
    pub phase_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "klbrd_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 120.]),
            &["resource"],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "klbrd_controller_reconciliation_errors_total",
                "Total count of reconciliation errors",
            ),
            &["resource", "instance", "error"],
        )?;
        let reconciliations = IntCounterVec::new(
            opts!(
                "klbrd_controller_reconciliation_total",
                "Total count of reconciliations",
            ),
            &["resource", "instance"],
        )?;
        let failed_attempts = IntGaugeVec::new(
            opts!(
                "klbrd_controller_failed_attempts",
                "The number of failed attempts of a backup or restore request"
            ),
            &["resource", "instance"],
        )?;
        let phase_transitions = IntCounterVec::new(
            opts!(
                "klbrd_controller_phase_transitions_total",
                "Total count of backup and restore phase transitions"
            ),
            &["resource", "phase"],
        )?;

        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            failed_attempts,
            phase_transitions,
        })
    }

    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failed_attempts.clone()))?;
        registry.register(Box::new(self.phase_transitions.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: Resource<DynamicType = ()>, E: TraceableError>(
        &self,
        resource: &T,
        error: &E,
    ) {
        self.failures
            .with_label_values(&[&kind::<T>(), &resource.name_any(), &error.metric_label()])
            .inc()
    }

    pub fn reconciliation<T: Resource<DynamicType = ()>>(&self, resource: &T) {
        self.reconciliations
            .with_label_values(&[&kind::<T>(), &resource.name_any()])
            .inc()
    }

    /// Count a reconciliation and observe its duration when the returned guard is dropped.
    pub fn count_and_measure<T: Resource<DynamicType = ()>>(
        &self,
        resource: &T,
    ) -> ReconcileMeasurer {
        self.reconciliation(resource);
        ReconcileMeasurer {
            start: Instant::now(),
            resource: kind::<T>(),
            metric: self.reconcile_duration.clone(),
        }
    }

    pub fn failed_attempts_set<T: Resource<DynamicType = ()>>(&self, resource: &T, val: i64) {
        self.failed_attempts
            .with_label_values(&[&kind::<T>(), &resource.name_any()])
            .set(val)
    }

    pub fn phase_transition<T: Resource<DynamicType = ()>>(&self, phase: Phase) {
        self.phase_transitions
            .with_label_values(&[&kind::<T>(), &phase.to_string()])
            .inc()
    }
}

fn kind<T: Resource<DynamicType = ()>>() -> String {
    ApiResource::erase::<T>(&()).kind
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    resource: String,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[&self.resource])
            .observe(duration);
    }
}
