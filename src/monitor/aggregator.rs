//! Aggregation engine: turns samples into window statistics and outcomes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::alerts::Alerter;
use super::counters::EngineCounters;
use super::detector::{Outcome, Transition, TransitionDetector, TransitionLog};
use super::sample::Sample;
use super::state::{TargetState, TargetStore};
use super::window::WindowEntry;
use super::MonitorError;
use crate::config::{Comparison, MetricRule};
use crate::db::transition_key;
use crate::scheduler::PersistBuffer;

/// Maps metric values to outcomes using per-metric threshold rules.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: HashMap<String, MetricRule>,
}

impl Classifier {
    pub fn new(rules: &[MetricRule]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| (r.metric.clone(), r.clone()))
                .collect(),
        }
    }

    /// Classify a value. `None` if the metric has no rule.
    pub fn classify(&self, metric: &str, value: f64) -> Option<Outcome> {
        let rule = self.rules.get(metric)?;
        let beyond = |threshold: f64| match rule.comparison {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
        };

        let outcome = if beyond(rule.fail) {
            Outcome::Fail
        } else if rule.warn.map_or(false, beyond) {
            Outcome::Warn
        } else {
            Outcome::Ok
        };
        Some(outcome)
    }
}

pub struct Aggregator {
    store: Arc<TargetStore>,
    classifier: Classifier,
    detector: TransitionDetector,
    log: Arc<TransitionLog>,
    alerts: Arc<Alerter>,
    persist: Arc<PersistBuffer>,
    counters: Arc<EngineCounters>,
}

impl Aggregator {
    pub fn new(
        store: Arc<TargetStore>,
        classifier: Classifier,
        detector: TransitionDetector,
        log: Arc<TransitionLog>,
        alerts: Arc<Alerter>,
        persist: Arc<PersistBuffer>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            store,
            classifier,
            detector,
            log,
            alerts,
            persist,
            counters,
        }
    }

    /// Validate and classify a sample without touching any state.
    fn check(&self, sample: &Sample) -> Result<Outcome, MonitorError> {
        sample.validate()?;
        self.classifier
            .classify(&sample.metric_name, sample.value)
            .ok_or_else(|| {
                MonitorError::MalformedSample(format!(
                    "unknown metric {:?} for {}",
                    sample.metric_name, sample.target_id
                ))
            })
    }

    /// Apply one sample to its target.
    ///
    /// Malformed samples are counted and returned as errors; they never change
    /// any target.
    pub fn process(&self, sample: Sample) -> Result<Option<Transition>, MonitorError> {
        let outcome = match self.check(&sample) {
            Ok(outcome) => outcome,
            Err(e) => {
                EngineCounters::incr(&self.counters.malformed);
                tracing::debug!("Aggregator: Dropped sample: {}", e);
                return Err(e);
            }
        };

        let transition = self.store.upsert(&sample.target_id, |state| {
            state.rolling_window.push(WindowEntry {
                metric: sample.metric_name.clone(),
                value: sample.value,
                observed_at: sample.observed_at,
            });
            state.stats = state.rolling_window.stats();
            state.samples_seen += 1;
            if state.last_sample_at.map_or(true, |t| sample.observed_at > t) {
                state.last_sample_at = Some(sample.observed_at);
            }

            let transition = self
                .detector
                .observe(state, outcome, sample.observed_at, &self.log);
            if let Some(t) = &transition {
                self.record(state, t);
            }
            transition
        });

        EngineCounters::incr(&self.counters.processed);
        Ok(transition)
    }

    /// Evict expired window entries, mark silent targets UNKNOWN and
    /// open or close NETWORK_DOWN alerts.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Transition> {
        let mut transitions = Vec::new();
        self.store.for_each_mut(|state| {
            self.expire_window(state, now);
            self.alerts.check_network(state, now);
            if let Some(t) = self.detector.check_silence(state, now, &self.log) {
                self.record(state, &t);
                transitions.push(t);
            }
        });
        transitions
    }

    fn expire_window(&self, state: &mut TargetState, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(state.rolling_window.horizon()) else {
            return;
        };
        if state.rolling_window.evict_older_than(cutoff) > 0 {
            state.stats = state.rolling_window.stats();
        }
    }

    /// Count, log and persist a transition, then update alerts. Called under
    /// the target's lock.
    fn record(&self, state: &TargetState, t: &Transition) {
        EngineCounters::incr(&self.counters.transitions);
        tracing::info!(
            "Aggregator: {} {} -> {} ({})",
            t.target_id,
            t.from,
            t.to,
            t.reason
        );
        self.persist
            .enqueue_json(transition_key(t.occurred_at, &t.target_id, t.seq), t);
        self.alerts.on_transition(state, t);
    }

    pub fn log(&self) -> &Arc<TransitionLog> {
        &self.log
    }

    pub fn alerts(&self) -> &Arc<Alerter> {
        &self.alerts
    }
}
