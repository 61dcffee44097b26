//! Process-internal counters and histograms.
//!
//! Every state transition, lease outcome, stall, retry and eviction is
//! counted here. The registry is not exposed over HTTP by this crate;
//! exposition belongs to the deployment wrapper.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};

/// Counter/histogram bundle shared by the control-plane services.
pub struct Metrics {
    registry: Registry,

    /// Transitions labeled `{from, to}`.
    pub state_transitions: IntCounterVec,
    /// Lease attempts labeled `{outcome}` (`acquired` | `busy`).
    pub lease_outcomes: IntCounterVec,
    /// Encoder stalls labeled `{strategy}`.
    pub encoder_stalls: IntCounterVec,
    /// Fallback-ladder retries labeled `{strategy}`.
    pub encoder_retries: IntCounterVec,
    /// Sessions and orphan directories removed by the sweeper.
    pub sweeper_deletions: IntCounter,
    /// VOD cache evictions labeled `{cause}` (`ttl` | `pressure`).
    pub cache_evictions: IntCounterVec,
    /// Seconds from accepted intent to READY.
    pub time_to_ready_secs: Histogram,
}

impl Metrics {
    /// Creates and registers the full metric set on a private registry.
    ///
    /// # Panics
    /// Panics if registration fails, which only happens on duplicate
    /// metric names within one registry and is therefore a programming error.
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let state_transitions = IntCounterVec::new(
            Opts::new("e2cast_state_transitions_total", "Session state transitions"),
            &["from", "to"],
        )
        .expect("valid metric definition");
        let lease_outcomes = IntCounterVec::new(
            Opts::new("e2cast_lease_outcomes_total", "Lease acquisition outcomes"),
            &["outcome"],
        )
        .expect("valid metric definition");
        let encoder_stalls = IntCounterVec::new(
            Opts::new("e2cast_encoder_stalls_total", "Encoder progress stalls"),
            &["strategy"],
        )
        .expect("valid metric definition");
        let encoder_retries = IntCounterVec::new(
            Opts::new("e2cast_encoder_retries_total", "Fallback-ladder retries"),
            &["strategy"],
        )
        .expect("valid metric definition");
        let sweeper_deletions = IntCounter::new(
            "e2cast_sweeper_deletions_total",
            "Sessions and orphan directories removed by the sweeper",
        )
        .expect("valid metric definition");
        let cache_evictions = IntCounterVec::new(
            Opts::new("e2cast_cache_evictions_total", "VOD cache evictions"),
            &["cause"],
        )
        .expect("valid metric definition");
        let time_to_ready_secs = Histogram::with_opts(
            HistogramOpts::new(
                "e2cast_time_to_ready_seconds",
                "Seconds from accepted intent to READY",
            )
            .buckets(vec![0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 30.0, 60.0]),
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(state_transitions.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(lease_outcomes.clone()),
            Box::new(encoder_stalls.clone()),
            Box::new(encoder_retries.clone()),
            Box::new(sweeper_deletions.clone()),
            Box::new(cache_evictions.clone()),
            Box::new(time_to_ready_secs.clone()),
        ] {
            registry
                .register(collector)
                .expect("no duplicate metric names");
        }

        Self {
            registry,
            state_transitions,
            lease_outcomes,
            encoder_stalls,
            encoder_retries,
            sweeper_deletions,
            cache_evictions,
            time_to_ready_secs,
        }
    }

    /// The underlying registry, for deployments that wire up exposition.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records a state transition.
    pub fn record_transition(&self, from: &str, to: &str) {
        self.state_transitions.with_label_values(&[from, to]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_transition("new", "starting");
        metrics.record_transition("new", "starting");
        metrics.lease_outcomes.with_label_values(&["busy"]).inc();

        assert_eq!(
            metrics
                .state_transitions
                .with_label_values(&["new", "starting"])
                .get(),
            2
        );
        assert_eq!(metrics.lease_outcomes.with_label_values(&["busy"]).get(), 1);
    }

    #[test]
    fn registry_gathers_all_families() {
        let metrics = Metrics::new();
        metrics.sweeper_deletions.inc();
        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "e2cast_sweeper_deletions_total"));
    }
}
