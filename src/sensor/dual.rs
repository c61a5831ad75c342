/// Dual-sensor coordinator.
///
/// Owns both water level sensors on one shared converter and produces the
/// per-cycle `CombinedReading`. The leak signal is the divergence between
/// the monitored (reference) container and a sealed (control) container at
/// the same fill level: evaporation and temperature move both sensors
/// together, a leak moves only the reference.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::adc::{self, SharedAdc};
use crate::config::CalibrationProfile;
use crate::logging::{self, Subsystem};
use crate::model::{
    AcquisitionError, CombinedReading, HealthState, LeakStatus, SensorId, SensorReading,
};
use crate::sensor::health::HealthStatus;
use crate::sensor::level::{TareResult, WaterLevelSensor};

/// Divergence (percentage points) at which a combined reading is classified
/// `LeakDetected`. This classification is informational and persisted with
/// the reading; the alerting pipeline applies its own configured threshold
/// and hysteresis on top.
pub const LEAK_DIFFERENCE_PERCENT: f64 = 5.0;

/// Health verdicts for both sensors, captured in one pass.
#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub reference: HealthStatus,
    pub control: HealthStatus,
}

impl SystemHealth {
    /// Worst of the two sensor verdicts.
    pub fn overall(&self) -> HealthState {
        match (self.reference.status, self.control.status) {
            (HealthState::Failed, _) | (_, HealthState::Failed) => HealthState::Failed,
            (HealthState::Degraded, _) | (_, HealthState::Degraded) => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }
}

pub struct DualSensorMonitor {
    reference: WaterLevelSensor,
    control: WaterLevelSensor,
}

impl DualSensorMonitor {
    /// Bring up both sensors on the shared converter, all or nothing.
    ///
    /// Each channel is probed once before the coordinator is considered
    /// initialized; a probe failure on either channel fails the whole
    /// bring-up and no half-initialized coordinator is ever returned.
    pub fn init_at(
        adc: SharedAdc,
        reference_cal: CalibrationProfile,
        control_cal: CalibrationProfile,
        now: DateTime<Utc>,
    ) -> Result<Self, AcquisitionError> {
        {
            let mut converter = adc.lock().unwrap();
            for (id, channel) in [
                (SensorId::Reference, adc::CHANNEL_REFERENCE),
                (SensorId::Control, adc::CHANNEL_CONTROL),
            ] {
                if let Err(e) = converter.read_raw(channel) {
                    logging::error(
                        Subsystem::Adc,
                        Some(id.name()),
                        &format!("Probe of channel {} failed: {}", channel, e),
                    );
                    return Err(e.into());
                }
            }
        }

        let reference = WaterLevelSensor::new_at(
            adc.clone(),
            adc::CHANNEL_REFERENCE,
            SensorId::Reference,
            reference_cal,
            now,
        );
        let control = WaterLevelSensor::new_at(
            adc,
            adc::CHANNEL_CONTROL,
            SensorId::Control,
            control_cal,
            now,
        );

        logging::info(Subsystem::Sensor, None, "Both sensors initialized");
        Ok(Self { reference, control })
    }

    /// Forwarded acquisition pacing override, see
    /// [`WaterLevelSensor::set_timing`].
    pub fn set_timing(&mut self, sample_delay: Duration, recovery_pause: Duration) {
        self.reference.set_timing(sample_delay, recovery_pause);
        self.control.set_timing(sample_delay, recovery_pause);
    }

    // --- Sampling -----------------------------------------------------------

    /// Read both sensors and classify the divergence.
    ///
    /// Reference first, then control. Individual read failures surface as
    /// cached percentages from the sensor layer, so this always yields a
    /// `CombinedReading`.
    pub fn read_both_at(&mut self, now: DateTime<Utc>) -> CombinedReading {
        let reference = Self::snapshot(&mut self.reference, now);
        let control = Self::snapshot(&mut self.control, now);

        let difference = reference.percentage - control.percentage;
        let status = if difference.abs() >= LEAK_DIFFERENCE_PERCENT {
            LeakStatus::LeakDetected
        } else {
            LeakStatus::Normal
        };

        CombinedReading {
            reference,
            control,
            difference,
            status,
            timestamp: now,
        }
    }

    fn snapshot(sensor: &mut WaterLevelSensor, now: DateTime<Utc>) -> SensorReading {
        let percentage = sensor.read_percentage_at(now);
        SensorReading {
            raw: sensor.last_raw().unwrap_or(0),
            voltage: sensor.last_voltage().unwrap_or(0.0),
            percentage,
            timestamp: now,
        }
    }

    /// Run the health checks on both sensors.
    pub fn system_health_at(&mut self, now: DateTime<Utc>) -> SystemHealth {
        SystemHealth {
            reference: self.reference.health_status_at(now),
            control: self.control.health_status_at(now),
        }
    }

    // --- Calibration routing ------------------------------------------------

    pub fn calibrate_sensor(
        &mut self,
        id: SensorId,
        is_empty: bool,
    ) -> Result<i32, AcquisitionError> {
        self.sensor_mut(id).calibrate(is_empty)
    }

    pub fn tare_sensor(
        &mut self,
        id: SensorId,
        now: DateTime<Utc>,
    ) -> Result<TareResult, AcquisitionError> {
        self.sensor_mut(id).tare_at(now)
    }

    pub fn calibration_values(&self, id: SensorId) -> CalibrationProfile {
        match id {
            SensorId::Reference => self.reference.calibration(),
            SensorId::Control => self.control.calibration(),
        }
    }

    fn sensor_mut(&mut self, id: SensorId) -> &mut WaterLevelSensor {
        match id {
            SensorId::Reference => &mut self.reference,
            SensorId::Control => &mut self.control,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
