/// Reading and alert persistence.
///
/// The sampling loop talks to a `ReadingStore` trait object, so the worker
/// logic is identical whether backed by Postgres (`PgStore`, production) or
/// an in-memory vector (`MemoryStore`, tests and machines without a
/// database). Time windows are passed in as explicit cutoffs rather than
/// computed internally, matching the clock injection used everywhere else
/// in the crate.

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};

use crate::logging::{self, Subsystem};
use crate::model::{AlertRecord, CombinedReading, LeakStatus, SensorReading};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    Db(postgres::Error),
    /// The backend refused the operation, e.g. a wrapper surfacing a
    /// dropped connection.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Db(e) => write!(f, "Database error: {}", e),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<postgres::Error> for StoreError {
    fn from(e: postgres::Error) -> Self {
        StoreError::Db(e)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregates over the readings newer than a cutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingStatistics {
    pub sample_count: i64,
    pub avg_reference: f64,
    pub avg_control: f64,
    pub avg_difference: f64,
    pub min_difference: f64,
    pub max_difference: f64,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

pub trait ReadingStore: Send {
    fn store_reading(&mut self, reading: &CombinedReading) -> Result<(), StoreError>;

    /// Persist an alert, returning its row id.
    fn store_alert(&mut self, alert: &AlertRecord) -> Result<i64, StoreError>;

    fn latest_reading(&mut self) -> Result<Option<CombinedReading>, StoreError>;

    /// Readings newer than `since`, newest first, at most `limit` rows.
    fn readings_since(
        &mut self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CombinedReading>, StoreError>;

    /// Unacknowledged alerts, newest first.
    fn active_alerts(&mut self) -> Result<Vec<(i64, AlertRecord)>, StoreError>;

    /// Mark one alert acknowledged. `Ok(false)` when no such row exists.
    fn acknowledge_alert(&mut self, id: i64) -> Result<bool, StoreError>;

    /// Aggregates over readings newer than `since`; `None` when empty.
    fn statistics(&mut self, since: DateTime<Utc>) -> Result<Option<ReadingStatistics>, StoreError>;

    /// Delete readings and acknowledged alerts older than `cutoff`.
    /// Returns the number of rows removed.
    fn cleanup_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

fn status_from_str(s: &str) -> LeakStatus {
    if s == LeakStatus::LeakDetected.as_str() {
        LeakStatus::LeakDetected
    } else {
        LeakStatus::Normal
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

pub struct PgStore {
    client: Client,
}

impl PgStore {
    /// Connect and ensure the schema exists.
    pub fn connect(url: &str) -> Result<Self, StoreError> {
        let mut client = Client::connect(url, NoTls)?;

        client.batch_execute(
            "
            CREATE TABLE IF NOT EXISTS readings (
                id BIGSERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                reference_raw INTEGER NOT NULL,
                reference_voltage DOUBLE PRECISION NOT NULL,
                reference_percentage DOUBLE PRECISION NOT NULL,
                control_raw INTEGER NOT NULL,
                control_voltage DOUBLE PRECISION NOT NULL,
                control_percentage DOUBLE PRECISION NOT NULL,
                difference DOUBLE PRECISION NOT NULL,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_readings_timestamp
                ON readings (timestamp DESC);

            CREATE TABLE IF NOT EXISTS alerts (
                id BIGSERIAL PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                alert_type TEXT NOT NULL,
                message TEXT NOT NULL,
                difference DOUBLE PRECISION NOT NULL,
                acknowledged BOOLEAN NOT NULL DEFAULT FALSE
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_timestamp
                ON alerts (timestamp DESC);
            ",
        )?;

        logging::info(Subsystem::Database, None, "Connected, schema ready");
        Ok(Self { client })
    }

    fn row_to_reading(row: &postgres::Row) -> CombinedReading {
        let timestamp: DateTime<Utc> = row.get(0);
        let status: String = row.get(8);
        CombinedReading {
            reference: SensorReading {
                raw: row.get(1),
                voltage: row.get(2),
                percentage: row.get(3),
                timestamp,
            },
            control: SensorReading {
                raw: row.get(4),
                voltage: row.get(5),
                percentage: row.get(6),
                timestamp,
            },
            difference: row.get(7),
            status: status_from_str(&status),
            timestamp,
        }
    }
}

const READING_COLUMNS: &str = "timestamp, reference_raw, reference_voltage, \
     reference_percentage, control_raw, control_voltage, control_percentage, \
     difference, status";

impl ReadingStore for PgStore {
    fn store_reading(&mut self, reading: &CombinedReading) -> Result<(), StoreError> {
        self.client.execute(
            "INSERT INTO readings (timestamp, reference_raw, reference_voltage,
                 reference_percentage, control_raw, control_voltage,
                 control_percentage, difference, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &reading.timestamp,
                &reading.reference.raw,
                &reading.reference.voltage,
                &reading.reference.percentage,
                &reading.control.raw,
                &reading.control.voltage,
                &reading.control.percentage,
                &reading.difference,
                &reading.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn store_alert(&mut self, alert: &AlertRecord) -> Result<i64, StoreError> {
        let row = self.client.query_one(
            "INSERT INTO alerts (timestamp, alert_type, message, difference, acknowledged)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
            &[
                &alert.timestamp,
                &alert.alert_type,
                &alert.message,
                &alert.difference,
                &alert.acknowledged,
            ],
        )?;
        Ok(row.get(0))
    }

    fn latest_reading(&mut self) -> Result<Option<CombinedReading>, StoreError> {
        let rows = self.client.query(
            &format!(
                "SELECT {} FROM readings ORDER BY timestamp DESC LIMIT 1",
                READING_COLUMNS
            ),
            &[],
        )?;
        Ok(rows.first().map(Self::row_to_reading))
    }

    fn readings_since(
        &mut self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CombinedReading>, StoreError> {
        let rows = self.client.query(
            &format!(
                "SELECT {} FROM readings
                 WHERE timestamp > $1
                 ORDER BY timestamp DESC
                 LIMIT $2",
                READING_COLUMNS
            ),
            &[&since, &(limit as i64)],
        )?;
        Ok(rows.iter().map(Self::row_to_reading).collect())
    }

    fn active_alerts(&mut self) -> Result<Vec<(i64, AlertRecord)>, StoreError> {
        let rows = self.client.query(
            "SELECT id, timestamp, alert_type, message, difference, acknowledged
             FROM alerts
             WHERE NOT acknowledged
             ORDER BY timestamp DESC",
            &[],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<_, i64>(0),
                    AlertRecord {
                        timestamp: row.get(1),
                        alert_type: row.get(2),
                        message: row.get(3),
                        difference: row.get(4),
                        acknowledged: row.get(5),
                    },
                )
            })
            .collect())
    }

    fn acknowledge_alert(&mut self, id: i64) -> Result<bool, StoreError> {
        let updated = self.client.execute(
            "UPDATE alerts SET acknowledged = TRUE WHERE id = $1",
            &[&id],
        )?;
        Ok(updated > 0)
    }

    fn statistics(&mut self, since: DateTime<Utc>) -> Result<Option<ReadingStatistics>, StoreError> {
        let row = self.client.query_one(
            "SELECT COUNT(*),
                    AVG(reference_percentage),
                    AVG(control_percentage),
                    AVG(difference),
                    MIN(difference),
                    MAX(difference)
             FROM readings
             WHERE timestamp > $1",
            &[&since],
        )?;

        let sample_count: i64 = row.get(0);
        if sample_count == 0 {
            return Ok(None);
        }
        Ok(Some(ReadingStatistics {
            sample_count,
            avg_reference: row.get(1),
            avg_control: row.get(2),
            avg_difference: row.get(3),
            min_difference: row.get(4),
            max_difference: row.get(5),
        }))
    }

    fn cleanup_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let readings = self
            .client
            .execute("DELETE FROM readings WHERE timestamp < $1", &[&cutoff])?;
        let alerts = self.client.execute(
            "DELETE FROM alerts WHERE timestamp < $1 AND acknowledged",
            &[&cutoff],
        )?;
        let removed = readings + alerts;
        if removed > 0 {
            logging::info(
                Subsystem::Database,
                None,
                &format!("Cleanup removed {} rows", removed),
            );
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Vector-backed store for tests and database-less operation. Readings are
/// kept in insertion order, which the service guarantees is chronological.
pub struct MemoryStore {
    readings: Vec<CombinedReading>,
    alerts: Vec<(i64, AlertRecord)>,
    next_alert_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            readings: Vec::new(),
            alerts: Vec::new(),
            next_alert_id: 1,
        }
    }
}

impl ReadingStore for MemoryStore {
    fn store_reading(&mut self, reading: &CombinedReading) -> Result<(), StoreError> {
        self.readings.push(reading.clone());
        Ok(())
    }

    fn store_alert(&mut self, alert: &AlertRecord) -> Result<i64, StoreError> {
        let id = self.next_alert_id;
        self.next_alert_id += 1;
        self.alerts.push((id, alert.clone()));
        Ok(id)
    }

    fn latest_reading(&mut self) -> Result<Option<CombinedReading>, StoreError> {
        Ok(self.readings.last().cloned())
    }

    fn readings_since(
        &mut self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CombinedReading>, StoreError> {
        Ok(self
            .readings
            .iter()
            .rev()
            .filter(|r| r.timestamp > since)
            .take(limit)
            .cloned()
            .collect())
    }

    fn active_alerts(&mut self) -> Result<Vec<(i64, AlertRecord)>, StoreError> {
        let mut active: Vec<(i64, AlertRecord)> = self
            .alerts
            .iter()
            .filter(|(_, a)| !a.acknowledged)
            .cloned()
            .collect();
        active.reverse();
        Ok(active)
    }

    fn acknowledge_alert(&mut self, id: i64) -> Result<bool, StoreError> {
        for (alert_id, alert) in &mut self.alerts {
            if *alert_id == id {
                alert.acknowledged = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn statistics(&mut self, since: DateTime<Utc>) -> Result<Option<ReadingStatistics>, StoreError> {
        let window: Vec<&CombinedReading> = self
            .readings
            .iter()
            .filter(|r| r.timestamp > since)
            .collect();
        if window.is_empty() {
            return Ok(None);
        }

        let n = window.len() as f64;
        let avg = |f: fn(&CombinedReading) -> f64| window.iter().map(|r| f(r)).sum::<f64>() / n;
        let differences = window.iter().map(|r| r.difference);

        Ok(Some(ReadingStatistics {
            sample_count: window.len() as i64,
            avg_reference: avg(|r| r.reference.percentage),
            avg_control: avg(|r| r.control.percentage),
            avg_difference: avg(|r| r.difference),
            min_difference: differences.clone().fold(f64::INFINITY, f64::min),
            max_difference: differences.fold(f64::NEG_INFINITY, f64::max),
        }))
    }

    fn cleanup_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.readings.len() + self.alerts.len();
        self.readings.retain(|r| r.timestamp >= cutoff);
        self.alerts
            .retain(|(_, a)| a.timestamp >= cutoff || !a.acknowledged);
        Ok((before - self.readings.len() - self.alerts.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
