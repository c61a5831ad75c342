/// Core data types for the dual-sensor leak monitoring service.
///
/// This module defines the shared domain model imported by all other modules.
/// Types only: no logic, no I/O, no dependencies beyond chrono.

use chrono::{DateTime, Utc};

use crate::adc::AdcError;

// ---------------------------------------------------------------------------
// Sensor identity
// ---------------------------------------------------------------------------

/// The two physical sensors the service compares.
///
/// `Reference` sits in the monitored container; `Control` sits in a sealed
/// container at the same fill level. Water loss in the reference that the
/// control does not mirror is the leak signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    Reference,
    Control,
}

impl SensorId {
    /// Human-readable sensor name, used in logs and alert messages.
    pub fn name(&self) -> &'static str {
        match self {
            SensorId::Reference => "Reference",
            SensorId::Control => "Control",
        }
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// One averaged acquisition from a single sensor.
///
/// Produced fresh on every sampling cycle and immutable afterwards. Only the
/// enclosing `CombinedReading` is persisted, never this on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Averaged raw ADC value (16-bit converter, 0-65535).
    pub raw: i32,
    /// Averaged channel voltage in volts.
    pub voltage: f64,
    /// Water level as a percentage of the calibrated range, clamped to
    /// [0, 100] and rounded to one decimal.
    pub percentage: f64,
    pub timestamp: DateTime<Utc>,
}

/// Leak classification attached to a combined reading.
///
/// This is the coordinator's informational classification using its fixed
/// 5.0% default. The authoritative alerting decision (with hysteresis and
/// cooldown) is made by `alert::leak::LeakDetector` and may use a different
/// configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakStatus {
    Normal,
    LeakDetected,
}

impl LeakStatus {
    /// Stable string form used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeakStatus::Normal => "normal",
            LeakStatus::LeakDetected => "leak_detected",
        }
    }
}

/// Both sensors read in one sampling cycle, plus the divergence analysis.
///
/// Produced once per cycle by `sensor::dual::DualSensorMonitor::read_both_at`
/// and handed to the store and the leak detector.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedReading {
    pub reference: SensorReading,
    pub control: SensorReading,
    /// `reference.percentage - control.percentage`, signed.
    pub difference: f64,
    pub status: LeakStatus,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Health types
// ---------------------------------------------------------------------------

/// Per-sensor health verdict.
///
/// Transitions are sticky: `Degraded`/`Failed` persist across checks until
/// the explicit recovery rules in `sensor::health` demote them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Alert types
// ---------------------------------------------------------------------------

/// A persisted alert. The core only constructs the unacknowledged instance;
/// acknowledgement is the store's concern.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    /// Alert category, e.g. "leak_detected".
    pub alert_type: String,
    pub message: String,
    /// The sensor difference (in percentage points) that triggered the alert.
    pub difference: f64,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise when acquiring a reading from the sensor stack.
///
/// None of these terminate the sampling loop: the read path recovers locally
/// (cached value) and the loop's outer handler logs and backs off.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    /// The underlying converter reported a hardware/channel failure for
    /// every sample in an averaging run.
    Adc(AdcError),
    /// The coordinator was asked to read before successful initialization.
    NotInitialized,
    /// Calibration endpoints are equal, so the percentage interpolation is
    /// undefined. Rejected explicitly rather than dividing by zero.
    InvalidCalibration { empty_raw: i32, full_raw: i32 },
}

impl std::fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionError::Adc(e) => write!(f, "ADC acquisition failed: {}", e),
            AcquisitionError::NotInitialized => write!(f, "Sensors not initialized"),
            AcquisitionError::InvalidCalibration { empty_raw, full_raw } => write!(
                f,
                "Invalid calibration: empty_raw ({}) equals full_raw ({})",
                empty_raw, full_raw
            ),
        }
    }
}

impl std::error::Error for AcquisitionError {}

impl From<AdcError> for AcquisitionError {
    fn from(e: AdcError) -> Self {
        AcquisitionError::Adc(e)
    }
}
