/// Per-sensor health monitoring.
///
/// Turns rolling raw/voltage history into an actionable verdict without
/// blocking the read path: recording is O(1), and `check_at` recomputes the
/// verdict from history on demand.
///
/// # Clock injection
/// All time-dependent entry points take `now: DateTime<Utc>` rather than
/// calling `Utc::now()` internally, so the drift gate and window math are
/// deterministic in tests. Production callers pass `Utc::now()`.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashSet, VecDeque};

use crate::model::HealthState;

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Rolling history capacity per series (ring-buffer semantics).
const HISTORY_CAPACITY: usize = 100;

/// Read errors in a row that force a `Failed` verdict.
const ERROR_STREAK_LIMIT: u32 = 5;

/// Samples inspected by the voltage stability check.
const STABILITY_WINDOW: usize = 10;

/// Voltage range across the stability window that counts as unstable.
const UNSTABLE_RANGE_VOLTS: f64 = 0.5;

/// Mean voltage below this suggests a disconnected sensor.
const DISCONNECT_VOLTS: f64 = 0.1;

/// Mean voltage above this suggests a short circuit.
const SHORT_CIRCUIT_VOLTS: f64 = 3.2;

/// Minimum interval between drift checks.
const DRIFT_CHECK_INTERVAL_SECS: i64 = 86_400;

/// Total history needed before drift is evaluated at all.
const DRIFT_MIN_HISTORY: usize = 50;

/// Samples required in each comparison window.
const DRIFT_MIN_WINDOW_SAMPLES: usize = 5;

/// Mean-voltage change over ~24h that counts as calibration drift.
const DRIFT_LIMIT_VOLTS: f64 = 0.2;

/// Samples inspected by the stuck-reading check.
const STUCK_WINDOW: usize = 20;

/// Fewer distinct raw values than this across the window means stuck.
const STUCK_MIN_DISTINCT: usize = 3;

/// Samples inspected by the stability score.
const SCORE_WINDOW: usize = 20;

/// Minimum samples before the score is meaningful; below this it is neutral.
const SCORE_MIN_SAMPLES: usize = 5;

// ---------------------------------------------------------------------------
// Health verdict
// ---------------------------------------------------------------------------

/// Snapshot returned by [`SensorHealthMonitor::check_at`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStatus {
    pub sensor: String,
    pub status: HealthState,
    pub issues: Vec<String>,
    /// Most recent recorded voltage, 0.0 if nothing recorded yet.
    pub last_voltage: f64,
    /// 0-100 heuristic from recent voltage variance; 50 is neutral.
    pub stability_score: f64,
    pub consecutive_errors: u32,
}

impl HealthStatus {
    /// Whether the issue list contains a stuck-reading flag. Drives the
    /// auto-recovery attempt in the sensor read path.
    pub fn has_stuck_issue(&self) -> bool {
        self.issues.iter().any(|i| i.contains("stuck"))
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Rolling-history health monitor for one physical sensor.
///
/// Owned exclusively by its `WaterLevelSensor`; histories are never shared.
pub struct SensorHealthMonitor {
    sensor_name: String,
    voltage_history: VecDeque<(DateTime<Utc>, f64)>,
    raw_history: VecDeque<(DateTime<Utc>, i32)>,
    consecutive_errors: u32,
    status: HealthState,
    last_drift_check: DateTime<Utc>,
}

impl SensorHealthMonitor {
    /// Create a monitor. `now` seeds the drift-check gate so the first drift
    /// evaluation happens no earlier than 24h after startup.
    pub fn new_at(sensor_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            sensor_name: sensor_name.to_string(),
            voltage_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            raw_history: VecDeque::with_capacity(HISTORY_CAPACITY),
            consecutive_errors: 0,
            status: HealthState::Healthy,
            last_drift_check: now,
        }
    }

    /// Record one successful acquisition. Resets the error streak.
    pub fn record_at(&mut self, voltage: f64, raw: i32, now: DateTime<Utc>) {
        self.voltage_history.push_back((now, voltage));
        if self.voltage_history.len() > HISTORY_CAPACITY {
            self.voltage_history.pop_front();
        }

        self.raw_history.push_back((now, raw));
        if self.raw_history.len() > HISTORY_CAPACITY {
            self.raw_history.pop_front();
        }

        self.consecutive_errors = 0;
    }

    /// Record a failed acquisition.
    pub fn record_error(&mut self) {
        self.consecutive_errors += 1;
    }

    /// Recompute the health verdict from current history.
    ///
    /// Status stickiness: a clean check demotes `Failed` to `Healthy`, and a
    /// dirty check promotes `Healthy` to `Degraded`; `Degraded` does not
    /// clear itself, which keeps flapping sensors visible.
    pub fn check_at(&mut self, now: DateTime<Utc>) -> HealthStatus {
        let mut issues = Vec::new();

        // Error streak forces Failed regardless of everything else.
        if self.consecutive_errors > ERROR_STREAK_LIMIT {
            self.status = HealthState::Failed;
            issues.push(format!(
                "Consecutive read errors: {}",
                self.consecutive_errors
            ));
        }

        if let Some(issue) = self.check_voltage_stability() {
            issues.push(issue);
        }

        if let Some(issue) = self.check_calibration_drift(now) {
            issues.push(issue);
        }

        if let Some(issue) = self.check_stuck_readings() {
            issues.push(issue);
        }

        if issues.is_empty() && self.status == HealthState::Failed {
            self.status = HealthState::Healthy;
        } else if !issues.is_empty() && self.status == HealthState::Healthy {
            self.status = HealthState::Degraded;
        }

        HealthStatus {
            sensor: self.sensor_name.clone(),
            status: self.status,
            issues,
            last_voltage: self.voltage_history.back().map(|(_, v)| *v).unwrap_or(0.0),
            stability_score: self.stability_score(),
            consecutive_errors: self.consecutive_errors,
        }
    }

    /// Status as of the last `check_at` call, without recomputation.
    pub fn state(&self) -> HealthState {
        self.status
    }

    // --- Sub-checks ---------------------------------------------------------

    /// Voltage range and absolute level over the last 10 samples.
    fn check_voltage_stability(&self) -> Option<String> {
        if self.voltage_history.len() < STABILITY_WINDOW {
            return None;
        }

        let recent: Vec<f64> = self
            .voltage_history
            .iter()
            .rev()
            .take(STABILITY_WINDOW)
            .map(|(_, v)| *v)
            .collect();

        let max = recent.iter().cloned().fold(f64::MIN, f64::max);
        let min = recent.iter().cloned().fold(f64::MAX, f64::min);
        let range = max - min;

        if range > UNSTABLE_RANGE_VOLTS {
            return Some(format!("Unstable voltage: {:.3}V range", range));
        }

        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean < DISCONNECT_VOLTS {
            return Some("Voltage too low - possible disconnection".to_string());
        }
        if mean > SHORT_CIRCUIT_VOLTS {
            return Some("Voltage too high - possible short circuit".to_string());
        }

        None
    }

    /// Long-horizon drift: mean voltage >23h ago vs the last hour, evaluated
    /// at most once per 24h. Skipped checks (too little history, sparse
    /// windows) do not consume the gate.
    fn check_calibration_drift(&mut self, now: DateTime<Utc>) -> Option<String> {
        if now - self.last_drift_check < Duration::seconds(DRIFT_CHECK_INTERVAL_SECS) {
            return None;
        }

        if self.voltage_history.len() < DRIFT_MIN_HISTORY {
            return None;
        }

        let old_cutoff = now - Duration::seconds(82_800); // 23 hours
        let new_cutoff = now - Duration::seconds(3_600); // 1 hour

        let old: Vec<f64> = self
            .voltage_history
            .iter()
            .filter(|(t, _)| *t < old_cutoff)
            .map(|(_, v)| *v)
            .collect();
        let new: Vec<f64> = self
            .voltage_history
            .iter()
            .filter(|(t, _)| *t > new_cutoff)
            .map(|(_, v)| *v)
            .collect();

        if old.len() < DRIFT_MIN_WINDOW_SAMPLES || new.len() < DRIFT_MIN_WINDOW_SAMPLES {
            return None;
        }

        let old_avg = old.iter().sum::<f64>() / old.len() as f64;
        let new_avg = new.iter().sum::<f64>() / new.len() as f64;
        let drift = (new_avg - old_avg).abs();

        self.last_drift_check = now;

        if drift > DRIFT_LIMIT_VOLTS {
            return Some(format!(
                "Possible calibration drift: {:.3}V change in 24h",
                drift
            ));
        }

        None
    }

    /// Stuck detection: fewer than 3 distinct raw values across the last 20.
    fn check_stuck_readings(&self) -> Option<String> {
        if self.raw_history.len() < STUCK_WINDOW {
            return None;
        }

        let distinct: HashSet<i32> = self
            .raw_history
            .iter()
            .rev()
            .take(STUCK_WINDOW)
            .map(|(_, r)| *r)
            .collect();

        if distinct.len() < STUCK_MIN_DISTINCT {
            return Some(format!(
                "Sensor appears stuck: only {} unique values in {} readings",
                distinct.len(),
                STUCK_WINDOW
            ));
        }

        None
    }

    /// 0-100 score from the voltage range over the last 20 samples; neutral
    /// 50 with fewer than 5 samples.
    fn stability_score(&self) -> f64 {
        if self.voltage_history.len() < SCORE_MIN_SAMPLES {
            return 50.0;
        }

        let recent: Vec<f64> = self
            .voltage_history
            .iter()
            .rev()
            .take(SCORE_WINDOW)
            .map(|(_, v)| *v)
            .collect();

        let max = recent.iter().cloned().fold(f64::MIN, f64::max);
        let min = recent.iter().cloned().fold(f64::MAX, f64::min);
        let range = max - min;

        let score = (100.0 - range * 100.0).max(0.0);
        (score * 10.0).round() / 10.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
