/// Leak alert decision logic.
///
/// A pure state machine over sensor differences: no I/O, no clock reads,
/// no references to the sensor stack. Each sampling cycle feeds it one
/// difference and a timestamp; it answers whether an alert should fire.
///
/// Two guards keep it quiet. Hysteresis: a single divergent reading never
/// alerts, the divergence must persist for a configured number of
/// consecutive cycles. Cooldown: once an alert fires, further alerts are
/// suppressed for a configured window even if the divergence persists.

use chrono::{DateTime, Duration, Utc};

/// Outcome of evaluating one sampling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakDecision {
    /// Difference within threshold; the streak was reset.
    Normal,
    /// Divergent, but the streak has not reached the alert bar yet.
    Accumulating(u32),
    /// Alert now. The detector state is untouched; the caller confirms
    /// with [`LeakDetector::record_alert_at`] once the alert is persisted.
    Fire,
    /// The streak reached the bar but a recent alert is still cooling down.
    /// The streak is kept, so the next cycle retries the cooldown gate.
    Suppressed,
}

/// Coarse detector phase for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakPhase {
    /// No divergence streak and no alert on record.
    Normal,
    /// A divergence streak is building.
    Accumulating,
    /// An alert has fired; no streak is currently building.
    Alerted,
}

pub struct LeakDetector {
    threshold_percent: f64,
    consecutive_required: u32,
    cooldown: Duration,
    consecutive_leak_readings: u32,
    last_alert_time: Option<DateTime<Utc>>,
}

impl LeakDetector {
    pub fn new(threshold_percent: f64, consecutive_required: u32, cooldown_secs: u64) -> Self {
        Self {
            threshold_percent,
            consecutive_required,
            cooldown: Duration::seconds(cooldown_secs as i64),
            consecutive_leak_readings: 0,
            last_alert_time: None,
        }
    }

    /// Adopt updated settings without losing the streak or cooldown state.
    pub fn configure(&mut self, threshold_percent: f64, consecutive_required: u32, cooldown_secs: u64) {
        self.threshold_percent = threshold_percent;
        self.consecutive_required = consecutive_required;
        self.cooldown = Duration::seconds(cooldown_secs as i64);
    }

    /// Current streak length, for status reporting.
    pub fn consecutive_leak_readings(&self) -> u32 {
        self.consecutive_leak_readings
    }

    pub fn last_alert_time(&self) -> Option<DateTime<Utc>> {
        self.last_alert_time
    }

    pub fn phase(&self) -> LeakPhase {
        if self.consecutive_leak_readings > 0 {
            LeakPhase::Accumulating
        } else if self.last_alert_time.is_some() {
            LeakPhase::Alerted
        } else {
            LeakPhase::Normal
        }
    }

    /// Evaluate one cycle's signed difference (reference minus control).
    ///
    /// A `Fire` decision does not change detector state. The caller calls
    /// [`record_alert_at`](Self::record_alert_at) after the alert is safely
    /// stored; until then the streak survives and the next cycle fires
    /// again instead of waiting out a cooldown that announced nothing.
    pub fn evaluate_at(&mut self, difference: f64, now: DateTime<Utc>) -> LeakDecision {
        if difference.abs() <= self.threshold_percent {
            self.consecutive_leak_readings = 0;
            return LeakDecision::Normal;
        }

        self.consecutive_leak_readings += 1;
        if self.consecutive_leak_readings < self.consecutive_required {
            return LeakDecision::Accumulating(self.consecutive_leak_readings);
        }

        if let Some(last) = self.last_alert_time {
            if now - last < self.cooldown {
                return LeakDecision::Suppressed;
            }
        }

        LeakDecision::Fire
    }

    /// Record a fired alert once it has been persisted. Opens the cooldown
    /// window and resets the streak.
    pub fn record_alert_at(&mut self, now: DateTime<Utc>) {
        self.last_alert_time = Some(now);
        self.consecutive_leak_readings = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
