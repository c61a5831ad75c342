/// eTape water level sensor: averaged acquisition plus linear calibration.
///
/// Each instance owns one ADC channel and one health monitor. Every averaging
/// run holds the shared converter lock end to end, so two reads of the same
/// channel can never interleave and calibration updates apply only between
/// runs.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::adc::SharedAdc;
use crate::config::CalibrationProfile;
use crate::logging::{self, Subsystem};
use crate::model::{AcquisitionError, SensorId};
use crate::sensor::health::{HealthStatus, SensorHealthMonitor};

// ---------------------------------------------------------------------------
// Acquisition constants
// ---------------------------------------------------------------------------

/// Samples averaged per normal reading.
pub const DEFAULT_SAMPLES: u32 = 10;

/// Samples averaged when capturing a calibration endpoint.
pub const CALIBRATION_SAMPLES: u32 = 50;

/// Delay between consecutive samples of one averaging run.
const SAMPLE_DELAY: Duration = Duration::from_millis(10);

/// Pause before the throwaway reads of an auto-recovery attempt.
const RECOVERY_PAUSE: Duration = Duration::from_secs(2);

/// Throwaway reads taken to shake a stuck converter channel.
const RECOVERY_READS: u32 = 5;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of a tare operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TareResult {
    pub old_empty: i32,
    pub new_empty: i32,
    /// Voltage observed while taring, for the operator's records.
    pub voltage: f64,
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

pub struct WaterLevelSensor {
    adc: SharedAdc,
    channel: u8,
    id: SensorId,
    calibration: CalibrationProfile,
    health: SensorHealthMonitor,
    auto_recovery_enabled: bool,
    sample_delay: Duration,
    recovery_pause: Duration,
    last_raw: Option<i32>,
    last_voltage: Option<f64>,
    last_percentage: Option<f64>,
}

impl WaterLevelSensor {
    pub fn new_at(
        adc: SharedAdc,
        channel: u8,
        id: SensorId,
        calibration: CalibrationProfile,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            adc,
            channel,
            id,
            calibration,
            health: SensorHealthMonitor::new_at(id.name(), now),
            auto_recovery_enabled: true,
            sample_delay: SAMPLE_DELAY,
            recovery_pause: RECOVERY_PAUSE,
            last_raw: None,
            last_voltage: None,
            last_percentage: None,
        }
    }

    /// Override acquisition pacing. Tests use zero delays; production code
    /// keeps the defaults.
    pub fn set_timing(&mut self, sample_delay: Duration, recovery_pause: Duration) {
        self.sample_delay = sample_delay;
        self.recovery_pause = recovery_pause;
    }

    pub fn set_auto_recovery(&mut self, enabled: bool) {
        self.auto_recovery_enabled = enabled;
    }

    pub fn id(&self) -> SensorId {
        self.id
    }

    pub fn calibration(&self) -> CalibrationProfile {
        self.calibration
    }

    pub fn last_raw(&self) -> Option<i32> {
        self.last_raw
    }

    pub fn last_voltage(&self) -> Option<f64> {
        self.last_voltage
    }

    pub fn last_percentage(&self) -> Option<f64> {
        self.last_percentage
    }

    // --- Averaged acquisition ----------------------------------------------

    /// Acquire `samples` raw conversions and return their integer mean.
    ///
    /// Non-positive conversions are discarded as error sentinels. If samples
    /// were acquired but all discarded the result is `Ok(0)`; only when every
    /// sample was a hardware error does this return `Err`.
    pub fn read_raw(&mut self, samples: u32) -> Result<i32, AcquisitionError> {
        let mut readings: Vec<i64> = Vec::with_capacity(samples as usize);
        let mut last_error = None;

        {
            let mut adc = self.adc.lock().unwrap();
            for i in 0..samples {
                match adc.read_raw(self.channel) {
                    Ok(value) if value > 0 => readings.push(value as i64),
                    Ok(_) => {}
                    Err(e) => last_error = Some(e),
                }
                if i + 1 < samples && !self.sample_delay.is_zero() {
                    std::thread::sleep(self.sample_delay);
                }
            }
        }

        if readings.is_empty() {
            return match last_error {
                Some(e) => Err(e.into()),
                None => Ok(0),
            };
        }

        let mean = (readings.iter().sum::<i64>() / readings.len() as i64) as i32;
        self.last_raw = Some(mean);
        Ok(mean)
    }

    /// Acquire `samples` voltage conversions and return their mean.
    /// Same filtering rules as [`read_raw`](Self::read_raw); total filtering
    /// yields `Ok(0.0)`.
    pub fn read_voltage(&mut self, samples: u32) -> Result<f64, AcquisitionError> {
        let mut readings: Vec<f64> = Vec::with_capacity(samples as usize);
        let mut last_error = None;

        {
            let mut adc = self.adc.lock().unwrap();
            for i in 0..samples {
                match adc.read_voltage(self.channel) {
                    Ok(value) if value > 0.0 => readings.push(value),
                    Ok(_) => {}
                    Err(e) => last_error = Some(e),
                }
                if i + 1 < samples && !self.sample_delay.is_zero() {
                    std::thread::sleep(self.sample_delay);
                }
            }
        }

        if readings.is_empty() {
            return match last_error {
                Some(e) => Err(e.into()),
                None => Ok(0.0),
            };
        }

        let mean = readings.iter().sum::<f64>() / readings.len() as f64;
        self.last_voltage = Some(mean);
        Ok(mean)
    }

    // --- Percentage ---------------------------------------------------------

    /// Water level as a percentage of the calibrated range.
    ///
    /// Reads raw and voltage, feeds the health monitor, interpolates between
    /// the calibration endpoints, clamps to [0, 100] and rounds to one
    /// decimal. On acquisition failure the health monitor records an error
    /// and the previous cached percentage (0.0 if none) is returned; the
    /// read path never propagates hardware trouble to the sampling loop.
    pub fn read_percentage_at(&mut self, now: DateTime<Utc>) -> f64 {
        let acquired = self
            .read_raw(DEFAULT_SAMPLES)
            .and_then(|raw| self.read_voltage(DEFAULT_SAMPLES).map(|v| (raw, v)));

        let (raw, voltage) = match acquired {
            Ok(pair) => pair,
            Err(e) => {
                self.health.record_error();
                logging::error(
                    Subsystem::Sensor,
                    Some(self.id.name()),
                    &format!("Read failed: {}", e),
                );
                return self.last_percentage.unwrap_or(0.0);
            }
        };

        self.health.record_at(voltage, raw, now);

        let percentage = match self.raw_to_percentage(raw) {
            Ok(p) => p,
            Err(e) => {
                logging::error(
                    Subsystem::Sensor,
                    Some(self.id.name()),
                    &format!("Percentage computation failed: {}", e),
                );
                return self.last_percentage.unwrap_or(0.0);
            }
        };

        let clamped = percentage.clamp(0.0, 100.0);
        let rounded = (clamped * 10.0).round() / 10.0;
        self.last_percentage = Some(rounded);

        if self.should_attempt_recovery(now) {
            self.attempt_auto_recovery();
        }

        rounded
    }

    /// Linear interpolation between the calibration endpoints, unclamped.
    ///
    /// eTape resistance decreases as water rises, so conventionally
    /// `empty_raw > full_raw`; the formula is monotonic in either endpoint
    /// ordering. Equal endpoints are rejected explicitly rather than left to
    /// divide by zero.
    fn raw_to_percentage(&self, raw: i32) -> Result<f64, AcquisitionError> {
        let CalibrationProfile { empty_raw, full_raw } = self.calibration;
        if empty_raw == full_raw {
            return Err(AcquisitionError::InvalidCalibration { empty_raw, full_raw });
        }
        Ok((raw - empty_raw) as f64 / (full_raw - empty_raw) as f64 * 100.0)
    }

    // --- Calibration --------------------------------------------------------

    /// Capture a calibration endpoint from the sensor's current level.
    ///
    /// Uses a larger sample count than a normal read. Refuses a value that
    /// would collapse the two endpoints onto each other.
    pub fn calibrate(&mut self, is_empty: bool) -> Result<i32, AcquisitionError> {
        let raw = self.read_raw(CALIBRATION_SAMPLES)?;

        let opposite = if is_empty {
            self.calibration.full_raw
        } else {
            self.calibration.empty_raw
        };
        if raw == opposite {
            return Err(AcquisitionError::InvalidCalibration {
                empty_raw: if is_empty { raw } else { self.calibration.empty_raw },
                full_raw: if is_empty { self.calibration.full_raw } else { raw },
            });
        }

        if is_empty {
            self.calibration.empty_raw = raw;
            logging::info(
                Subsystem::Sensor,
                Some(self.id.name()),
                &format!("Empty calibration set to {}", raw),
            );
        } else {
            self.calibration.full_raw = raw;
            logging::info(
                Subsystem::Sensor,
                Some(self.id.name()),
                &format!("Full calibration set to {}", raw),
            );
        }

        Ok(raw)
    }

    /// Re-zero the empty endpoint at the sensor's current physical level.
    ///
    /// An immediate `read_percentage_at` on an unchanged level reads 0.0
    /// afterwards (within rounding).
    pub fn tare_at(&mut self, _now: DateTime<Utc>) -> Result<TareResult, AcquisitionError> {
        let raw = self.read_raw(DEFAULT_SAMPLES)?;
        let voltage = self.read_voltage(DEFAULT_SAMPLES)?;

        if raw == self.calibration.full_raw {
            return Err(AcquisitionError::InvalidCalibration {
                empty_raw: raw,
                full_raw: self.calibration.full_raw,
            });
        }

        let old_empty = self.calibration.empty_raw;
        self.calibration.empty_raw = raw;

        logging::info(
            Subsystem::Sensor,
            Some(self.id.name()),
            &format!("Tared: empty endpoint {} -> {}", old_empty, raw),
        );

        Ok(TareResult {
            old_empty,
            new_empty: raw,
            voltage,
        })
    }

    // --- Health -------------------------------------------------------------

    pub fn health_status_at(&mut self, now: DateTime<Utc>) -> HealthStatus {
        self.health.check_at(now)
    }

    fn should_attempt_recovery(&mut self, now: DateTime<Utc>) -> bool {
        if !self.auto_recovery_enabled {
            return false;
        }
        let status = self.health.check_at(now);
        status.status == crate::model::HealthState::Degraded && status.has_stuck_issue()
    }

    /// Best-effort recovery for a stuck channel: pause, then a handful of
    /// throwaway reads. Never propagates failure to the caller.
    fn attempt_auto_recovery(&mut self) {
        logging::info(
            Subsystem::Sensor,
            Some(self.id.name()),
            "Attempting auto-recovery",
        );

        if !self.recovery_pause.is_zero() {
            std::thread::sleep(self.recovery_pause);
        }

        let mut adc = self.adc.lock().unwrap();
        for _ in 0..RECOVERY_READS {
            if let Err(e) = adc.read_raw(self.channel) {
                logging::warn(
                    Subsystem::Sensor,
                    Some(self.id.name()),
                    &format!("Auto-recovery read failed: {}", e),
                );
            }
            if !self.sample_delay.is_zero() {
                std::thread::sleep(self.sample_delay);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::{self, AdcError, AdcInterface};
    use chrono::TimeZone;

    /// Scripted ADC backend: cycles through the provided conversion results.
    struct MockAdc {
        raw: Vec<Result<i32, AdcError>>,
        voltage: Vec<Result<f64, AdcError>>,
        raw_index: usize,
        voltage_index: usize,
    }

    impl MockAdc {
        fn steady(raw: i32, voltage: f64) -> Self {
            Self {
                raw: vec![Ok(raw)],
                voltage: vec![Ok(voltage)],
                raw_index: 0,
                voltage_index: 0,
            }
        }

        fn scripted(raw: Vec<Result<i32, AdcError>>, voltage: Vec<Result<f64, AdcError>>) -> Self {
            Self {
                raw,
                voltage,
                raw_index: 0,
                voltage_index: 0,
            }
        }
    }

    impl AdcInterface for MockAdc {
        fn read_raw(&mut self, channel: u8) -> Result<i32, AdcError> {
            adc::check_channel(channel)?;
            // Past the end of the script the last entry repeats.
            let i = self.raw_index.min(self.raw.len() - 1);
            self.raw_index += 1;
            self.raw[i].clone()
        }

        fn read_voltage(&mut self, channel: u8) -> Result<f64, AdcError> {
            adc::check_channel(channel)?;
            let i = self.voltage_index.min(self.voltage.len() - 1);
            self.voltage_index += 1;
            self.voltage[i].clone()
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn sensor_with(adc: MockAdc, calibration: CalibrationProfile) -> WaterLevelSensor {
        let shared = adc::share(Box::new(adc));
        let mut sensor = WaterLevelSensor::new_at(
            shared,
            adc::CHANNEL_REFERENCE,
            SensorId::Reference,
            calibration,
            fixed_now(),
        );
        sensor.set_timing(Duration::ZERO, Duration::ZERO);
        sensor
    }

    fn default_cal() -> CalibrationProfile {
        CalibrationProfile {
            empty_raw: 50000,
            full_raw: 20000,
        }
    }

    // --- Averaging ----------------------------------------------------------

    #[test]
    fn test_read_raw_averages_valid_samples() {
        let adc = MockAdc::scripted(
            vec![Ok(30000), Ok(30010), Ok(30020), Ok(30030), Ok(30040)],
            vec![Ok(1.6)],
        );
        let mut sensor = sensor_with(adc, default_cal());

        let mean = sensor.read_raw(5).expect("read should succeed");
        assert_eq!(mean, 30020);
        assert_eq!(sensor.last_raw(), Some(30020));
    }

    #[test]
    fn test_read_raw_discards_non_positive_samples() {
        let adc = MockAdc::scripted(
            vec![Ok(30000), Ok(0), Ok(-1), Ok(30010)],
            vec![Ok(1.6)],
        );
        let mut sensor = sensor_with(adc, default_cal());

        let mean = sensor.read_raw(4).expect("read should succeed");
        assert_eq!(mean, 30005, "zeros and negatives must not skew the mean");
    }

    #[test]
    fn test_read_raw_all_discarded_returns_zero() {
        let adc = MockAdc::scripted(vec![Ok(0)], vec![Ok(1.6)]);
        let mut sensor = sensor_with(adc, default_cal());

        assert_eq!(sensor.read_raw(10), Ok(0));
        assert_eq!(sensor.last_raw(), None, "a zero result is not cached");
    }

    #[test]
    fn test_read_raw_all_hardware_errors_is_err() {
        let adc = MockAdc::scripted(
            vec![Err(AdcError::ReadFailed("bus timeout".to_string()))],
            vec![Ok(1.6)],
        );
        let mut sensor = sensor_with(adc, default_cal());

        let err = sensor.read_raw(10).unwrap_err();
        assert!(matches!(err, AcquisitionError::Adc(_)));
    }

    #[test]
    fn test_partial_hardware_errors_still_average() {
        let adc = MockAdc::scripted(
            vec![
                Err(AdcError::ReadFailed("glitch".to_string())),
                Ok(30000),
                Ok(30020),
            ],
            vec![Ok(1.6)],
        );
        let mut sensor = sensor_with(adc, default_cal());

        assert_eq!(sensor.read_raw(3), Ok(30010));
    }

    // --- Percentage ---------------------------------------------------------

    #[test]
    fn test_percentage_at_calibration_endpoints() {
        let sensor = sensor_with(MockAdc::steady(1, 1.6), default_cal());
        assert_eq!(sensor.raw_to_percentage(50000).unwrap(), 0.0);
        assert_eq!(sensor.raw_to_percentage(20000).unwrap(), 100.0);
    }

    #[test]
    fn test_percentage_is_monotonic_as_raw_decreases() {
        // empty_raw > full_raw: less resistance (lower raw) = more water.
        let sensor = sensor_with(MockAdc::steady(1, 1.6), default_cal());
        let mut previous = f64::MIN;
        for raw in (20000..=50000).rev().step_by(1000) {
            let pct = sensor.raw_to_percentage(raw).unwrap();
            assert!(
                pct >= previous,
                "percentage must not decrease as raw drops: raw={} pct={}",
                raw,
                pct
            );
            previous = pct;
        }
    }

    #[test]
    fn test_percentage_handles_inverted_calibration() {
        // full_raw > empty_raw still interpolates monotonically.
        let cal = CalibrationProfile {
            empty_raw: 20000,
            full_raw: 50000,
        };
        let sensor = sensor_with(MockAdc::steady(1, 1.6), cal);
        assert_eq!(sensor.raw_to_percentage(20000).unwrap(), 0.0);
        assert_eq!(sensor.raw_to_percentage(50000).unwrap(), 100.0);
        assert!((sensor.raw_to_percentage(35000).unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_read_percentage_clamps_out_of_range_raw() {
        // Raw beyond the empty endpoint would be negative pre-clamp.
        let mut sensor = sensor_with(MockAdc::steady(60000, 1.6), default_cal());
        assert_eq!(sensor.read_percentage_at(fixed_now()), 0.0);

        // Raw beyond the full endpoint would exceed 100 pre-clamp.
        let mut sensor = sensor_with(MockAdc::steady(10000, 1.6), default_cal());
        assert_eq!(sensor.read_percentage_at(fixed_now()), 100.0);
    }

    #[test]
    fn test_read_percentage_rounds_to_one_decimal() {
        // raw 30001 -> (50000-30001)/30000*100 = 66.663...
        let mut sensor = sensor_with(MockAdc::steady(30001, 1.6), default_cal());
        let pct = sensor.read_percentage_at(fixed_now());
        assert_eq!(pct, 66.7);
    }

    #[test]
    fn test_read_percentage_returns_cached_value_on_failure() {
        // First averaging run succeeds, then the converter dies for good.
        let mut raw: Vec<Result<i32, AdcError>> = vec![Ok(35000); DEFAULT_SAMPLES as usize];
        raw.push(Err(AdcError::ReadFailed("dead".to_string())));
        let adc = MockAdc::scripted(raw, vec![Ok(1.6)]);
        let mut sensor = sensor_with(adc, default_cal());

        let first = sensor.read_percentage_at(fixed_now());
        assert_eq!(first, 50.0);

        let second = sensor.read_percentage_at(fixed_now());
        assert_eq!(second, first, "failure must return the cached percentage");
    }

    #[test]
    fn test_read_percentage_returns_zero_on_failure_with_no_cache() {
        let adc = MockAdc::scripted(
            vec![Err(AdcError::ReadFailed("dead".to_string()))],
            vec![Err(AdcError::ReadFailed("dead".to_string()))],
        );
        let mut sensor = sensor_with(adc, default_cal());
        assert_eq!(sensor.read_percentage_at(fixed_now()), 0.0);
    }

    #[test]
    fn test_equal_endpoints_return_cached_not_panic() {
        let cal = CalibrationProfile {
            empty_raw: 30000,
            full_raw: 30000,
        };
        let mut sensor = sensor_with(MockAdc::steady(25000, 1.6), cal);
        // No cached value yet, so the degenerate calibration yields 0.0.
        assert_eq!(sensor.read_percentage_at(fixed_now()), 0.0);
    }

    // --- Calibration & tare -------------------------------------------------

    #[test]
    fn test_calibrate_empty_stores_averaged_endpoint() {
        let mut sensor = sensor_with(MockAdc::steady(48000, 1.6), default_cal());
        let raw = sensor.calibrate(true).expect("calibration should succeed");
        assert_eq!(raw, 48000);
        assert_eq!(sensor.calibration().empty_raw, 48000);
        assert_eq!(sensor.calibration().full_raw, 20000, "full endpoint untouched");
    }

    #[test]
    fn test_calibrate_full_stores_averaged_endpoint() {
        let mut sensor = sensor_with(MockAdc::steady(21000, 1.6), default_cal());
        let raw = sensor.calibrate(false).expect("calibration should succeed");
        assert_eq!(raw, 21000);
        assert_eq!(sensor.calibration().full_raw, 21000);
    }

    #[test]
    fn test_calibrate_rejects_collapsing_endpoints() {
        // Capturing an empty endpoint equal to the full endpoint would make
        // the interpolation undefined.
        let mut sensor = sensor_with(MockAdc::steady(20000, 1.6), default_cal());
        let err = sensor.calibrate(true).unwrap_err();
        assert!(matches!(err, AcquisitionError::InvalidCalibration { .. }));
        assert_eq!(sensor.calibration().empty_raw, 50000, "calibration unchanged");
    }

    #[test]
    fn test_tare_zeroes_sensor_at_current_level() {
        // Sensor sits at raw 35000 (50% with default calibration).
        let mut sensor = sensor_with(MockAdc::steady(35000, 1.6), default_cal());

        let result = sensor.tare_at(fixed_now()).expect("tare should succeed");
        assert_eq!(result.old_empty, 50000);
        assert_eq!(result.new_empty, 35000);
        assert!((result.voltage - 1.6).abs() < 1e-9);

        // Unchanged physical level now reads 0.0.
        assert_eq!(sensor.read_percentage_at(fixed_now()), 0.0);
    }
}
