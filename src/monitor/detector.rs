//! Transition detector and transition log.
//!
//! The detector is the only code that changes a target's status. Every
//! change is appended to the [`TransitionLog`] while the caller still holds
//! the target's lock, so the log and the status never disagree.
//!
//! Stable states follow consecutive outcome counts with hysteresis:
//!
//! ```text
//!   UNKNOWN --ok--> UP      UNKNOWN --warn--> DEGRADED      UNKNOWN --N fail--> DOWN
//!   UP --N fail--> DOWN     UP --N warn--> DEGRADED
//!   DEGRADED --N fail--> DOWN                DEGRADED --M ok--> UP
//!   DOWN --M ok--> UP       DOWN --M warn--> DEGRADED
//!   any --alternation rate--> FLAPPING --quiet for cooldown--> state of last outcome
//!   any --silence--> UNKNOWN
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::state::{TargetState, TargetStatus};
use crate::config::EngineConfig;

/// Classification of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Warn,
    Fail,
}

impl Outcome {
    /// Health as seen by flap detection: only failures count as unhealthy.
    pub fn is_healthy(self) -> bool {
        self != Outcome::Fail
    }

    /// Stable status a target settles into when this is its latest outcome.
    pub fn settled_status(self) -> TargetStatus {
        match self {
            Outcome::Ok => TargetStatus::Up,
            Outcome::Warn => TargetStatus::Degraded,
            Outcome::Fail => TargetStatus::Down,
        }
    }
}

/// An immutable record of a status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub target_id: String,
    pub from: TargetStatus,
    pub to: TargetStatus,
    pub occurred_at: DateTime<Utc>,
    pub reason: String,
    /// Device address at the time of the change, if the target has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Alternation history used for flap detection.
#[derive(Debug, Clone, Default)]
pub struct FlapTracker {
    alternations: VecDeque<DateTime<Utc>>,
    last_healthy: Option<bool>,
    quiet_since: Option<DateTime<Utc>>,
}

impl FlapTracker {
    /// Record an outcome and return the alternation count inside the window.
    fn record(&mut self, healthy: bool, at: DateTime<Utc>, window: ChronoDuration) -> usize {
        if let Some(previous) = self.last_healthy {
            if previous != healthy {
                self.alternations.push_back(at);
            }
        }
        self.last_healthy = Some(healthy);

        if let Some(cutoff) = at.checked_sub_signed(window) {
            self.alternations.retain(|t| *t > cutoff);
        }
        self.alternations.len()
    }
}

/// Append-only log of transitions.
///
/// Keeps the most recent `capacity` records in memory; older ones are only
/// available from the durable store.
pub struct TransitionLog {
    entries: RwLock<VecDeque<Transition>>,
    next_seq: AtomicU64,
    capacity: usize,
}

impl TransitionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            next_seq: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn append(
        &self,
        target_id: &str,
        from: TargetStatus,
        to: TargetStatus,
        occurred_at: DateTime<Utc>,
        reason: String,
        address: Option<String>,
    ) -> Transition {
        let mut entries = self.entries.write();
        let transition = Transition {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            target_id: target_id.to_string(),
            from,
            to,
            occurred_at,
            reason,
            address,
        };
        entries.push_back(transition.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        transition
    }

    /// Most recent transitions first, optionally for a single target.
    pub fn recent(&self, target_id: Option<&str>, limit: usize) -> Vec<Transition> {
        self.entries
            .read()
            .iter()
            .rev()
            .filter(|t| target_id.map_or(true, |id| t.target_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of transitions ever appended.
    pub fn total(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Thresholds driving the state machine.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub flap_rate: u32,
    pub flap_window: ChronoDuration,
    pub flap_cooldown: ChronoDuration,
    pub silence_timeout: ChronoDuration,
}

impl From<&EngineConfig> for DetectorConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            success_threshold: cfg.success_threshold,
            flap_rate: cfg.flap_rate,
            flap_window: cfg.flap_window(),
            flap_cooldown: cfg.flap_cooldown(),
            silence_timeout: cfg.silence_timeout(),
        }
    }
}

/// Per-target status state machine.
pub struct TransitionDetector {
    cfg: DetectorConfig,
}

impl TransitionDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self { cfg }
    }

    /// Feed one classified outcome observed at `at`.
    ///
    /// The caller must hold the target's lock for the whole call.
    pub fn observe(
        &self,
        state: &mut TargetState,
        outcome: Outcome,
        at: DateTime<Utc>,
        log: &TransitionLog,
    ) -> Option<Transition> {
        match outcome {
            Outcome::Ok => {
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
                state.consecutive_warnings = 0;
            }
            Outcome::Warn => {
                state.consecutive_warnings += 1;
                state.consecutive_successes = 0;
                state.consecutive_failures = 0;
            }
            Outcome::Fail => {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                state.consecutive_warnings = 0;
            }
        }
        state.last_outcome = Some(outcome);

        let flap_rate = self.cfg.flap_rate as usize;
        let alternations = state
            .flap
            .record(outcome.is_healthy(), at, self.cfg.flap_window);

        if state.current_status == TargetStatus::Flapping {
            if alternations >= flap_rate {
                state.flap.quiet_since = None;
                return None;
            }
            let quiet_since = *state.flap.quiet_since.get_or_insert(at);
            if at - quiet_since < self.cfg.flap_cooldown {
                return None;
            }
            state.flap.quiet_since = None;
            let reason = format!(
                "alternation rate below {} per {}s for {}s",
                flap_rate,
                self.cfg.flap_window.num_seconds(),
                self.cfg.flap_cooldown.num_seconds()
            );
            return Some(self.apply(state, outcome.settled_status(), at, reason, log));
        }

        if alternations >= flap_rate {
            state.flap.quiet_since = None;
            let reason = format!(
                "{} alternations within {}s",
                alternations,
                self.cfg.flap_window.num_seconds()
            );
            return Some(self.apply(state, TargetStatus::Flapping, at, reason, log));
        }

        let (next, reason) = self.next_stable(state)?;
        Some(self.apply(state, next, at, reason, log))
    }

    /// Mark a target UNKNOWN if it has been silent longer than the timeout.
    pub fn check_silence(
        &self,
        state: &mut TargetState,
        now: DateTime<Utc>,
        log: &TransitionLog,
    ) -> Option<Transition> {
        if state.current_status == TargetStatus::Unknown {
            return None;
        }
        let last = state.last_sample_at?;
        if now - last <= self.cfg.silence_timeout {
            return None;
        }

        state.reset_history();
        let reason = format!("no samples for {}s", (now - last).num_seconds());
        Some(self.apply(state, TargetStatus::Unknown, now, reason, log))
    }

    fn next_stable(&self, state: &TargetState) -> Option<(TargetStatus, String)> {
        let n = self.cfg.failure_threshold;
        let m = self.cfg.success_threshold;
        let failures = state.consecutive_failures;
        let successes = state.consecutive_successes;
        let warnings = state.consecutive_warnings;

        let next = match state.current_status {
            TargetStatus::Unknown if successes >= 1 => TargetStatus::Up,
            TargetStatus::Unknown if warnings >= 1 => TargetStatus::Degraded,
            TargetStatus::Unknown | TargetStatus::Up | TargetStatus::Degraded if failures >= n => {
                TargetStatus::Down
            }
            TargetStatus::Up if warnings >= n => TargetStatus::Degraded,
            TargetStatus::Degraded | TargetStatus::Down if successes >= m => TargetStatus::Up,
            TargetStatus::Down if warnings >= m => TargetStatus::Degraded,
            _ => return None,
        };

        let reason = match next {
            TargetStatus::Down => format!("{} consecutive failures", failures),
            TargetStatus::Up => format!("{} consecutive successes", successes),
            TargetStatus::Degraded => format!("{} consecutive warnings", warnings),
            _ => String::new(),
        };
        Some((next, reason))
    }

    fn apply(
        &self,
        state: &mut TargetState,
        to: TargetStatus,
        at: DateTime<Utc>,
        reason: String,
        log: &TransitionLog,
    ) -> Transition {
        let from = state.current_status;
        let address = state.device.as_ref().and_then(|d| d.ip.clone());
        let transition = log.append(&state.target_id, from, to, at, reason, address);
        state.current_status = to;
        state.last_transition_at = Some(at);
        transition
    }
}
