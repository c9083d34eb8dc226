//! Durable table of risk reports.
//!
//! One SQLite database per replica. The connection is serialized behind a
//! mutex and every public operation runs on the blocking pool, so callers may
//! issue them freely from async tasks. `append` is durable on return.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// Severity label on a report. GREEN reports never reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Green,
    Amber,
    Red,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Green => write!(f, "GREEN"),
            Tier::Amber => write!(f, "AMBER"),
            Tier::Red => write!(f, "RED"),
        }
    }
}

impl FromStr for Tier {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GREEN" => Ok(Tier::Green),
            "AMBER" => Ok(Tier::Amber),
            "RED" => Ok(Tier::Red),
            other => Err(VigilError::InvalidTier(other.to_string())),
        }
    }
}

/// A single risk report as stored and replicated.
///
/// `(patient_id, timestamp)` is the idempotency key; the store-local row id is
/// never part of this struct and never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub patient_id: String,
    /// Client wall-clock milliseconds at production time.
    pub timestamp: i64,
    pub age: f64,
    pub serum_sodium: f64,
    pub serum_creatinine: f64,
    pub ejection_fraction: f64,
    pub day: i64,
    pub probability: f64,
    pub tier: Tier,
    #[serde(default)]
    pub alert_sent: bool,
}

impl RiskReport {
    /// Validate the fields a report must carry before it may be persisted.
    pub fn validate(&self) -> Result<()> {
        if self.patient_id.is_empty() {
            return Err(VigilError::MalformedInput("empty patient_id".into()));
        }
        if self.timestamp <= 0 {
            return Err(VigilError::MalformedInput(format!(
                "non-positive timestamp {}",
                self.timestamp
            )));
        }
        for (name, value) in [
            ("age", self.age),
            ("serum_sodium", self.serum_sodium),
            ("serum_creatinine", self.serum_creatinine),
            ("ejection_fraction", self.ejection_fraction),
        ] {
            if !value.is_finite() {
                return Err(VigilError::MalformedInput(format!(
                    "non-finite {name}: {value}"
                )));
            }
        }
        if self.day < 0 {
            return Err(VigilError::MalformedInput(format!(
                "negative day {}",
                self.day
            )));
        }
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(VigilError::MalformedInput(format!(
                "probability {} outside [0, 1]",
                self.probability
            )));
        }
        Ok(())
    }
}

/// Outcome of an `append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub local_id: i64,
    /// False when the idempotency key already existed and nothing was written.
    pub inserted: bool,
    /// Alert flag of the row (only meaningful for duplicates).
    pub alert_sent: bool,
}

pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS risk_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    age REAL,
    serum_sodium REAL,
    serum_creatinine REAL,
    ejection_fraction REAL,
    day INTEGER,
    probability REAL,
    tier TEXT,
    alert_sent INTEGER DEFAULT 0,
    UNIQUE (patient_id, timestamp)
);
";

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// In-memory store for tests and standalone experiments.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    /// Persist a report. Durable on return; idempotent over
    /// `(patient_id, timestamp)`.
    pub async fn append(self: &Arc<Self>, report: RiskReport) -> Result<Appended> {
        let store = Arc::clone(self);
        run_blocking(move || store.append_sync(&report)).await
    }

    /// Set the alert flag on a committed row. No-op if already set.
    pub async fn mark_alert_sent(self: &Arc<Self>, local_id: i64) -> Result<()> {
        let store = Arc::clone(self);
        run_blocking(move || store.mark_alert_sent_sync(local_id)).await
    }

    /// Most recent `limit` reports for a patient (all when `limit == 0`),
    /// newest first by timestamp, ties broken by row id descending.
    pub async fn list_by_patient(
        self: &Arc<Self>,
        patient_id: String,
        limit: u32,
    ) -> Result<Vec<RiskReport>> {
        let store = Arc::clone(self);
        run_blocking(move || store.list_by_patient_sync(&patient_id, limit)).await
    }

    /// Full table dump, used for state transfer to joiners.
    pub async fn snapshot(self: &Arc<Self>) -> Result<Vec<RiskReport>> {
        let store = Arc::clone(self);
        run_blocking(move || store.snapshot_sync()).await
    }

    /// Atomically replace the table contents with `reports`.
    pub async fn load_snapshot(self: &Arc<Self>, reports: Vec<RiskReport>) -> Result<()> {
        let store = Arc::clone(self);
        run_blocking(move || store.load_snapshot_sync(reports)).await
    }

    pub async fn count(self: &Arc<Self>) -> Result<u64> {
        let store = Arc::clone(self);
        run_blocking(move || store.count_sync()).await
    }

    pub async fn is_empty(self: &Arc<Self>) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    fn append_sync(&self, report: &RiskReport) -> Result<Appended> {
        report.validate()?;
        if report.tier == Tier::Green {
            return Err(VigilError::InvalidTier(Tier::Green.to_string()));
        }

        let conn = self.lock();
        if let Some((local_id, alert_sent)) = Self::find_existing(&conn, report)? {
            return Ok(Appended {
                local_id,
                inserted: false,
                alert_sent,
            });
        }

        conn.execute(
            "INSERT INTO risk_reports
                 (patient_id, timestamp, age, serum_sodium, serum_creatinine,
                  ejection_fraction, day, probability, tier, alert_sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                report.patient_id,
                report.timestamp,
                report.age,
                report.serum_sodium,
                report.serum_creatinine,
                report.ejection_fraction,
                report.day,
                report.probability,
                report.tier.to_string(),
                report.alert_sent as i64,
            ],
        )?;
        Ok(Appended {
            local_id: conn.last_insert_rowid(),
            inserted: true,
            alert_sent: report.alert_sent,
        })
    }

    fn find_existing(conn: &Connection, report: &RiskReport) -> Result<Option<(i64, bool)>> {
        let row = conn
            .query_row(
                "SELECT id, alert_sent FROM risk_reports
                 WHERE patient_id = ?1 AND timestamp = ?2",
                params![report.patient_id, report.timestamp],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;
        Ok(row)
    }

    fn mark_alert_sent_sync(&self, local_id: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE risk_reports SET alert_sent = 1 WHERE id = ?1",
            params![local_id],
        )?;
        Ok(())
    }

    fn list_by_patient_sync(&self, patient_id: &str, limit: u32) -> Result<Vec<RiskReport>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT patient_id, timestamp, age, serum_sodium, serum_creatinine,
                    ejection_fraction, day, probability, tier, alert_sent
             FROM risk_reports
             WHERE patient_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let rows = stmt.query_map(params![patient_id, limit], row_to_report)?;
        collect_reports(rows)
    }

    fn snapshot_sync(&self) -> Result<Vec<RiskReport>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT patient_id, timestamp, age, serum_sodium, serum_creatinine,
                    ejection_fraction, day, probability, tier, alert_sent
             FROM risk_reports ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_report)?;
        collect_reports(rows)
    }

    fn load_snapshot_sync(&self, reports: Vec<RiskReport>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM risk_reports", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO risk_reports
                     (patient_id, timestamp, age, serum_sodium, serum_creatinine,
                      ejection_fraction, day, probability, tier, alert_sent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for report in &reports {
                report.validate()?;
                stmt.execute(params![
                    report.patient_id,
                    report.timestamp,
                    report.age,
                    report.serum_sodium,
                    report.serum_creatinine,
                    report.ejection_fraction,
                    report.day,
                    report.probability,
                    report.tier.to_string(),
                    report.alert_sent as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count_sync(&self) -> Result<u64> {
        let count: i64 =
            self.lock()
                .query_row("SELECT COUNT(*) FROM risk_reports", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another store call panicked mid-write.
        self.conn.lock().expect("store connection lock poisoned")
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("storage task panicked")
}

fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<RiskReport> {
    let tier: String = row.get(8)?;
    Ok(RiskReport {
        patient_id: row.get(0)?,
        timestamp: row.get(1)?,
        age: row.get(2)?,
        serum_sodium: row.get(3)?,
        serum_creatinine: row.get(4)?,
        ejection_fraction: row.get(5)?,
        day: row.get(6)?,
        probability: row.get(7)?,
        tier: tier.parse().unwrap_or(Tier::Amber),
        alert_sent: row.get::<_, i64>(9)? != 0,
    })
}

fn collect_reports(
    rows: impl Iterator<Item = rusqlite::Result<RiskReport>>,
) -> Result<Vec<RiskReport>> {
    let mut reports = Vec::new();
    for row in rows {
        reports.push(row?);
    }
    Ok(reports)
}
