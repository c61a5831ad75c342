/// End-to-end leak detection scenarios through the public engine API:
/// simulated converter in, stored readings and alerts out.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use leakmon_service::adc::{self, AdcError, AdcInterface};
use leakmon_service::alert::leak::LeakDecision;
use leakmon_service::config::MonitorConfig;
use leakmon_service::dev_mode::SimulatedAdc;
use leakmon_service::model::{CombinedReading, SensorId};
use leakmon_service::monitor::WaterMonitor;
use leakmon_service::notify::Notifier;
use leakmon_service::store::MemoryStore;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Jitter-free converter with one fixed raw value per channel.
struct FixedAdc {
    raw: [i32; 2],
}

impl AdcInterface for FixedAdc {
    fn read_raw(&mut self, channel: u8) -> Result<i32, AdcError> {
        adc::check_channel(channel)?;
        Ok(self.raw[channel as usize])
    }

    fn read_voltage(&mut self, channel: u8) -> Result<f64, AdcError> {
        let raw = self.read_raw(channel)?;
        Ok(raw as f64 / 65535.0 * 3.3)
    }
}

/// Captures every leak notification for assertions.
#[derive(Clone, Default)]
struct CollectingNotifier {
    leak_differences: Arc<Mutex<Vec<f64>>>,
}

impl Notifier for CollectingNotifier {
    fn notify_leak(&self, reading: &CombinedReading) -> bool {
        self.leak_differences.lock().unwrap().push(reading.difference);
        true
    }
    fn notify_system(&self, _alert_type: &str, _message: &str) -> bool {
        true
    }
    fn notify_recovery(&self, _message: &str) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 12, minute, 0).unwrap()
}

fn temp_config_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("leakmon_integration_test");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn engine_with(
    backend: Box<dyn AdcInterface>,
    config: MonitorConfig,
    config_name: &str,
) -> (WaterMonitor, CollectingNotifier) {
    let notifier = CollectingNotifier::default();
    let monitor = WaterMonitor::new(
        adc::share(backend),
        config,
        Box::new(MemoryStore::new()),
        Box::new(notifier.clone()),
        temp_config_path(config_name),
        at(0),
    );
    monitor.set_timing(Duration::ZERO, Duration::ZERO);
    (monitor, notifier)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_full_reference_empty_control_alerts_once_with_full_difference() {
    // Reference reads the full calibration endpoint, control the empty one:
    // a 100-point divergence sustained over three cycles.
    let backend = Box::new(FixedAdc {
        raw: [20000, 50000],
    });
    let (monitor, notifier) = engine_with(backend, MonitorConfig::default(), "e2e_full.toml");

    let mut fired = Vec::new();
    for minute in 0..3 {
        let outcome = monitor.sample_once_at(at(minute)).expect("cycle should run");
        assert_eq!(outcome.reading.reference.percentage, 100.0);
        assert_eq!(outcome.reading.control.percentage, 0.0);
        assert_eq!(outcome.reading.difference, 100.0);
        if outcome.alert_id.is_some() {
            fired.push(minute);
        }
    }

    assert_eq!(fired, vec![2], "exactly one alert, on the third cycle");
    let deliveries = notifier.leak_differences.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(
        (deliveries[0] - 100.0).abs() < 1e-9,
        "notified difference should be the full range, got {}",
        deliveries[0]
    );

    let status = monitor.status_at(at(3)).expect("status should answer");
    assert_eq!(status.active_alert_count, 1);
}

#[test]
fn test_slow_drain_on_reference_eventually_alerts_once() {
    // Both containers start matched; the reference loses half a point per
    // conversion, the control holds. The divergence crosses the threshold
    // after a few cycles and stays there, which must still produce exactly
    // one alert inside the cooldown window.
    let mut backend = SimulatedAdc::new(80.0, 80.0);
    backend
        .set_drain(adc::CHANNEL_REFERENCE, 0.5)
        .expect("channel 0 is wired");
    let (monitor, notifier) =
        engine_with(Box::new(backend), MonitorConfig::default(), "e2e_drain.toml");

    let mut fire_count = 0;
    for minute in 0..8 {
        let outcome = monitor.sample_once_at(at(minute)).expect("cycle should run");
        if outcome.decision == LeakDecision::Fire {
            fire_count += 1;
        }
    }

    assert_eq!(fire_count, 1, "a sustained drain alerts exactly once");
    assert_eq!(notifier.leak_differences.lock().unwrap().len(), 1);
    let delivered = notifier.leak_differences.lock().unwrap()[0];
    assert!(
        delivered < -5.0,
        "reference below control means a negative difference, got {}",
        delivered
    );
}

#[test]
fn test_alert_fires_again_after_cooldown_expires() {
    let backend = Box::new(FixedAdc {
        raw: [20000, 50000],
    });
    let config = MonitorConfig {
        alert_cooldown_secs: 600,
        ..MonitorConfig::default()
    };
    let (monitor, notifier) = engine_with(backend, config, "e2e_cooldown.toml");

    let mut fired_minutes = Vec::new();
    // 20 one-minute cycles span two 600-second cooldown windows.
    for minute in 0..20 {
        let outcome = monitor.sample_once_at(at(minute)).expect("cycle should run");
        if outcome.alert_id.is_some() {
            fired_minutes.push(minute);
        }
    }

    assert_eq!(
        fired_minutes,
        vec![2, 12],
        "second alert only after the cooldown expired"
    );
    assert_eq!(notifier.leak_differences.lock().unwrap().len(), 2);
    assert_eq!(monitor.status_at(at(20)).unwrap().active_alert_count, 2);
}

#[test]
fn test_matched_drift_in_both_containers_never_alerts() {
    // Evaporation: both containers drain at the same rate. The divergence
    // stays near zero, so no alert regardless of how far the levels fall.
    let mut backend = SimulatedAdc::new(80.0, 80.0);
    backend.set_drain(adc::CHANNEL_REFERENCE, 0.2).unwrap();
    backend.set_drain(adc::CHANNEL_CONTROL, 0.2).unwrap();
    let (monitor, notifier) =
        engine_with(Box::new(backend), MonitorConfig::default(), "e2e_evap.toml");

    for minute in 0..10 {
        let outcome = monitor.sample_once_at(at(minute)).expect("cycle should run");
        assert_eq!(
            outcome.decision,
            LeakDecision::Normal,
            "matched drift must stay normal at minute {} (diff {})",
            minute,
            outcome.reading.difference
        );
    }
    assert!(notifier.leak_differences.lock().unwrap().is_empty());
}

#[test]
fn test_tare_rezeroes_reference_through_the_engine() {
    // Reference sits mid-range; taring makes that level the new zero.
    let backend = Box::new(FixedAdc {
        raw: [35000, 35000],
    });
    let (monitor, _) = engine_with(backend, MonitorConfig::default(), "e2e_tare.toml");

    let before = monitor.current_reading_at(at(0)).expect("sensors are up");
    assert_eq!(before.reference.percentage, 50.0);

    let result = monitor
        .tare_sensor_at(SensorId::Reference, at(1))
        .expect("tare should succeed");
    assert_eq!(result.new_empty, 35000);

    let after = monitor.current_reading_at(at(2)).expect("sensors are up");
    assert_eq!(after.reference.percentage, 0.0, "tared level reads empty");
    assert_eq!(after.control.percentage, 50.0, "other sensor unaffected");
}
