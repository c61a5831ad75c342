/// Monitoring engine: owns the sensors, the store, the leak detector and
/// the background sampling loop.
///
/// All collaborators are injected at construction, so the engine runs
/// identically against real hardware with Postgres or against the
/// simulated converter with the in-memory store. One worker thread does
/// the sampling; control operations (calibrate, tare, settings, status)
/// come from other threads and synchronize on the shared state.
///
/// Lock order, where multiple locks are taken: sensors, store, config,
/// detector. Calibration and tare take the sensors lock, so they apply
/// between sampling cycles, never inside one.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::adc::SharedAdc;
use crate::alert::dispatch;
use crate::alert::leak::{LeakDecision, LeakDetector, LeakPhase};
use crate::config::{ConfigError, MonitorConfig, SettingsPatch};
use crate::logging::{self, Subsystem};
use crate::model::{AcquisitionError, CombinedReading, HealthState, SensorId};
use crate::notify::Notifier;
use crate::sensor::dual::{DualSensorMonitor, SystemHealth};
use crate::sensor::level::TareResult;
use crate::store::{ReadingStore, StoreError};

/// Pause after a failed sampling cycle before retrying.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Longest `stop()` waits for an in-flight cycle before detaching the worker.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Readings and acknowledged alerts older than this are purged.
const RETENTION_DAYS: i64 = 30;

/// Seconds between retention purges.
const CLEANUP_INTERVAL_SECS: i64 = 86_400;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MonitorError {
    Acquisition(AcquisitionError),
    Store(StoreError),
    Config(ConfigError),
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::Acquisition(e) => write!(f, "{}", e),
            MonitorError::Store(e) => write!(f, "{}", e),
            MonitorError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<AcquisitionError> for MonitorError {
    fn from(e: AcquisitionError) -> Self {
        MonitorError::Acquisition(e)
    }
}

impl From<StoreError> for MonitorError {
    fn from(e: StoreError) -> Self {
        MonitorError::Store(e)
    }
}

impl From<ConfigError> for MonitorError {
    fn from(e: ConfigError) -> Self {
        MonitorError::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

/// One completed sampling cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub reading: CombinedReading,
    pub decision: LeakDecision,
    /// Set when this cycle fired an alert.
    pub alert_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub running: bool,
    pub sensors_initialized: bool,
    pub leak_phase: LeakPhase,
    pub consecutive_leak_readings: u32,
    pub last_alert_time: Option<DateTime<Utc>>,
    pub active_alert_count: usize,
    pub latest_reading: Option<CombinedReading>,
    /// `None` in degraded mode.
    pub system_health: Option<SystemHealth>,
    pub sample_interval_secs: u64,
    pub leak_threshold_percent: f64,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct LoopState {
    shutdown: bool,
    running: bool,
}

struct Shared {
    /// `None` when sensor bring-up failed; the engine then answers queries
    /// from stored data but refuses to run the sampling loop.
    sensors: Mutex<Option<DualSensorMonitor>>,
    store: Mutex<Box<dyn ReadingStore>>,
    config: Mutex<MonitorConfig>,
    detector: Mutex<LeakDetector>,
    notifier: Box<dyn Notifier>,
    config_path: PathBuf,
    state: Mutex<LoopState>,
    wakeup: Condvar,
    /// Last seen health states, for transition notifications.
    last_health: Mutex<[HealthState; 2]>,
}

impl Shared {
    fn sample_once_at(&self, now: DateTime<Utc>) -> Result<CycleOutcome, MonitorError> {
        let (reading, health) = {
            let mut sensors = self.sensors.lock().unwrap();
            let sensors = sensors
                .as_mut()
                .ok_or(AcquisitionError::NotInitialized)?;
            let reading = sensors.read_both_at(now);
            let health = sensors.system_health_at(now);
            (reading, health)
        };

        self.note_health_transitions(&health);

        self.store.lock().unwrap().store_reading(&reading)?;

        let decision = {
            let config = self.config.lock().unwrap();
            let mut detector = self.detector.lock().unwrap();
            detector.configure(
                config.leak_threshold_percent,
                config.consecutive_readings_for_alert,
                config.alert_cooldown_secs,
            );
            detector.evaluate_at(reading.difference, now)
        };

        let alert_id = if decision == LeakDecision::Fire {
            let id = {
                let mut store = self.store.lock().unwrap();
                dispatch::dispatch_leak_alert(store.as_mut(), self.notifier.as_ref(), &reading)?
            };
            // The cooldown opens only once the alert row exists. A failed
            // write leaves the streak intact and the next cycle retries.
            self.detector.lock().unwrap().record_alert_at(now);
            Some(id)
        } else {
            None
        };

        logging::debug(
            Subsystem::Monitor,
            None,
            &format!(
                "Reading stored: Ref={:.1}%, Ctrl={:.1}%, Diff={:.1}%",
                reading.reference.percentage, reading.control.percentage, reading.difference
            ),
        );

        Ok(CycleOutcome {
            reading,
            decision,
            alert_id,
        })
    }

    /// Announce sensor failures and recoveries, once per transition.
    fn note_health_transitions(&self, health: &SystemHealth) {
        let mut last = self.last_health.lock().unwrap();
        for (slot, status) in [&health.reference, &health.control].into_iter().enumerate() {
            let previous = last[slot];
            let current = status.status;
            if previous == current {
                continue;
            }
            last[slot] = current;

            if current == HealthState::Failed {
                let detail = format!(
                    "{} sensor failed: {}",
                    status.sensor,
                    status.issues.join("; ")
                );
                logging::error(Subsystem::Monitor, Some(status.sensor.as_str()), &detail);
                self.notifier.notify_system("sensor_failure", &detail);
            } else if previous == HealthState::Failed {
                let detail = format!("{} sensor recovered", status.sensor);
                logging::info(Subsystem::Monitor, Some(status.sensor.as_str()), &detail);
                self.notifier.notify_recovery(&detail);
            }
        }
    }

    /// Copy the live calibration into the config and write it out. A write
    /// failure is logged, not propagated; the in-memory calibration stays
    /// authoritative for the running service.
    fn persist_calibration(&self) {
        let calibrations = {
            let sensors = self.sensors.lock().unwrap();
            sensors.as_ref().map(|s| {
                (
                    s.calibration_values(SensorId::Reference),
                    s.calibration_values(SensorId::Control),
                )
            })
        };
        let mut config = self.config.lock().unwrap();
        if let Some((reference, control)) = calibrations {
            config.reference_sensor = reference;
            config.control_sensor = control;
        }
        if let Err(e) = config.save(&self.config_path) {
            logging::warn(
                Subsystem::System,
                None,
                &format!("Failed to save configuration: {}", e),
            );
        } else {
            logging::info(Subsystem::System, None, "Configuration saved");
        }
    }

    /// Interruptible sleep between cycles. Returns false on shutdown.
    fn wait_for_next_cycle(&self, interval: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        let (guard, _) = self
            .wakeup
            .wait_timeout_while(guard, interval, |state| !state.shutdown)
            .unwrap();
        !guard.shutdown
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WaterMonitor {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl WaterMonitor {
    /// Build the engine and attempt sensor bring-up.
    ///
    /// Bring-up failure does not fail construction: the engine comes up in
    /// degraded mode, announces the failure, and still answers queries from
    /// stored data.
    pub fn new(
        adc: SharedAdc,
        config: MonitorConfig,
        store: Box<dyn ReadingStore>,
        notifier: Box<dyn Notifier>,
        config_path: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        let sensors = match DualSensorMonitor::init_at(
            adc,
            config.reference_sensor,
            config.control_sensor,
            now,
        ) {
            Ok(sensors) => Some(sensors),
            Err(e) => {
                let detail = format!("Sensor initialization failed: {}", e);
                logging::error(Subsystem::Monitor, None, &detail);
                notifier.notify_system("sensor_init_failed", &detail);
                None
            }
        };

        let detector = LeakDetector::new(
            config.leak_threshold_percent,
            config.consecutive_readings_for_alert,
            config.alert_cooldown_secs,
        );

        Self {
            shared: Arc::new(Shared {
                sensors: Mutex::new(sensors),
                store: Mutex::new(store),
                config: Mutex::new(config),
                detector: Mutex::new(detector),
                notifier,
                config_path,
                state: Mutex::new(LoopState {
                    shutdown: false,
                    running: false,
                }),
                wakeup: Condvar::new(),
                last_health: Mutex::new([HealthState::Healthy; 2]),
            }),
            worker: None,
        }
    }

    /// Forwarded acquisition pacing override for tests, see
    /// [`DualSensorMonitor::set_timing`].
    pub fn set_timing(&self, sample_delay: Duration, recovery_pause: Duration) {
        if let Some(sensors) = self.shared.sensors.lock().unwrap().as_mut() {
            sensors.set_timing(sample_delay, recovery_pause);
        }
    }

    // --- Lifecycle ----------------------------------------------------------

    /// Start the background sampling loop. A no-op when already running or
    /// when the sensors never initialized.
    pub fn start(&mut self) {
        if self.shared.sensors.lock().unwrap().is_none() {
            logging::warn(
                Subsystem::Monitor,
                None,
                "Sensors not initialized, monitoring loop will not run",
            );
            return;
        }
        if self.worker.is_some() {
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = false;
            state.running = true;
        }

        let shared = Arc::clone(&self.shared);
        self.worker = Some(thread::spawn(move || run_loop(shared)));
        logging::info(Subsystem::Monitor, None, "Water monitoring started");
    }

    /// Stop the sampling loop and wait for the worker to exit.
    ///
    /// The wait is bounded by [`STOP_TIMEOUT`]: the inter-cycle sleep is
    /// interrupted immediately, but an in-flight cycle (worst case a full
    /// acquisition including the recovery pause) is given that long to
    /// finish. A worker still busy past the bound is detached and exits
    /// on its own.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.take() {
            let deadline = std::time::Instant::now() + STOP_TIMEOUT;
            while !worker.is_finished() && std::time::Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    logging::error(Subsystem::Monitor, None, "Monitoring worker panicked");
                }
            } else {
                logging::error(
                    Subsystem::Monitor,
                    None,
                    &format!(
                        "Monitoring worker still busy after {}s, detaching",
                        STOP_TIMEOUT.as_secs()
                    ),
                );
            }
        }
        self.shared.state.lock().unwrap().running = false;
        logging::info(Subsystem::Monitor, None, "Water monitoring stopped");
    }

    // --- Operations ---------------------------------------------------------

    /// Run one sampling cycle immediately, outside the loop's schedule.
    pub fn sample_once_at(&self, now: DateTime<Utc>) -> Result<CycleOutcome, MonitorError> {
        self.shared.sample_once_at(now)
    }

    /// Fresh reading from both sensors, not persisted.
    pub fn current_reading_at(&self, now: DateTime<Utc>) -> Result<CombinedReading, MonitorError> {
        let mut sensors = self.shared.sensors.lock().unwrap();
        let sensors = sensors.as_mut().ok_or(AcquisitionError::NotInitialized)?;
        Ok(sensors.read_both_at(now))
    }

    /// Capture a calibration endpoint and persist the updated config.
    pub fn calibrate_sensor(&self, id: SensorId, is_empty: bool) -> Result<i32, MonitorError> {
        let raw = {
            let mut sensors = self.shared.sensors.lock().unwrap();
            let sensors = sensors.as_mut().ok_or(AcquisitionError::NotInitialized)?;
            sensors.calibrate_sensor(id, is_empty)?
        };
        self.shared.persist_calibration();
        Ok(raw)
    }

    /// Re-zero a sensor at its current level and persist the updated config.
    pub fn tare_sensor_at(
        &self,
        id: SensorId,
        now: DateTime<Utc>,
    ) -> Result<TareResult, MonitorError> {
        let result = {
            let mut sensors = self.shared.sensors.lock().unwrap();
            let sensors = sensors.as_mut().ok_or(AcquisitionError::NotInitialized)?;
            sensors.tare_sensor(id, now)?
        };
        self.shared.persist_calibration();
        Ok(result)
    }

    /// Apply a partial settings update. The running loop and detector pick
    /// the new values up on the next cycle.
    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<(), MonitorError> {
        {
            let mut config = self.shared.config.lock().unwrap();
            config.apply_patch(patch)?;
            if let Err(e) = config.save(&self.shared.config_path) {
                logging::warn(
                    Subsystem::System,
                    None,
                    &format!("Failed to save configuration: {}", e),
                );
            }
        }
        logging::info(Subsystem::System, None, "Settings updated");
        Ok(())
    }

    /// Acknowledge a stored alert.
    pub fn acknowledge_alert(&self, id: i64) -> Result<bool, MonitorError> {
        Ok(self.shared.store.lock().unwrap().acknowledge_alert(id)?)
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> Result<MonitorStatus, MonitorError> {
        let (sensors_initialized, system_health) = {
            let mut sensors = self.shared.sensors.lock().unwrap();
            match sensors.as_mut() {
                Some(sensors) => (true, Some(sensors.system_health_at(now))),
                None => (false, None),
            }
        };
        let (latest_reading, active_alert_count) = {
            let mut store = self.shared.store.lock().unwrap();
            (store.latest_reading()?, store.active_alerts()?.len())
        };
        let (sample_interval_secs, leak_threshold_percent) = {
            let config = self.shared.config.lock().unwrap();
            (config.sample_interval_secs, config.leak_threshold_percent)
        };
        let (leak_phase, consecutive_leak_readings, last_alert_time) = {
            let detector = self.shared.detector.lock().unwrap();
            (
                detector.phase(),
                detector.consecutive_leak_readings(),
                detector.last_alert_time(),
            )
        };

        Ok(MonitorStatus {
            running: self.shared.state.lock().unwrap().running,
            sensors_initialized,
            leak_phase,
            consecutive_leak_readings,
            last_alert_time,
            active_alert_count,
            latest_reading,
            system_health,
            sample_interval_secs,
            leak_threshold_percent,
        })
    }
}

impl Drop for WaterMonitor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn run_loop(shared: Arc<Shared>) {
    logging::info(Subsystem::Monitor, None, "Monitoring loop started");
    let mut last_cleanup = Utc::now();

    loop {
        let now = Utc::now();

        let interval = match shared.sample_once_at(now) {
            Ok(_) => {
                Duration::from_secs(shared.config.lock().unwrap().sample_interval_secs)
            }
            Err(e) => {
                logging::error(
                    Subsystem::Monitor,
                    None,
                    &format!("Monitor loop error: {}", e),
                );
                ERROR_BACKOFF
            }
        };

        if now - last_cleanup >= ChronoDuration::seconds(CLEANUP_INTERVAL_SECS) {
            let cutoff = now - ChronoDuration::days(RETENTION_DAYS);
            if let Err(e) = shared.store.lock().unwrap().cleanup_before(cutoff) {
                logging::error(
                    Subsystem::Database,
                    None,
                    &format!("Retention cleanup failed: {}", e),
                );
            }
            last_cleanup = now;
        }

        if !shared.wait_for_next_cycle(interval) {
            break;
        }
    }

    shared.state.lock().unwrap().running = false;
    logging::info(Subsystem::Monitor, None, "Monitoring loop stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
