//! SQLite-backed trip store.
//!
//! Every source file is one batch: its rows in `trips` and a bookkeeping
//! marker in `load_log`, both keyed by the batch key. A batch is written in a
//! single `IMMEDIATE` transaction, so a marker never exists without its rows.

use crate::constants::TIMESTAMP_FORMAT;
use crate::error::{IngestError, Result};
use crate::types::{DatasetIdentifier, LoadedBatch, Period, TripRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, CachedStatement, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS trips (
        id                    INTEGER PRIMARY KEY,
        batch_key             TEXT    NOT NULL,
        row_index             INTEGER NOT NULL,
        period_year           INTEGER NOT NULL,
        period_month          INTEGER NOT NULL,
        vendor_id             INTEGER,
        pickup_at             TEXT    NOT NULL,
        dropoff_at            TEXT    NOT NULL,
        passenger_count       REAL,
        trip_distance         REAL,
        ratecode_id           INTEGER,
        store_and_fwd_flag    TEXT,
        pickup_location       INTEGER,
        dropoff_location      INTEGER,
        payment_type          INTEGER,
        fare_amount           REAL,
        extra                 REAL,
        mta_tax               REAL,
        tip_amount            REAL,
        tolls_amount          REAL,
        improvement_surcharge REAL,
        total_amount          REAL,
        congestion_surcharge  REAL,
        airport_fee           REAL,
        cbd_congestion_fee    REAL,
        UNIQUE (batch_key, row_index)
    );
    CREATE INDEX IF NOT EXISTS idx_trips_period ON trips (period_year, period_month);
    CREATE INDEX IF NOT EXISTS idx_trips_pickup ON trips (pickup_at);
    CREATE TABLE IF NOT EXISTS load_log (
        batch_key      TEXT PRIMARY KEY,
        year           INTEGER NOT NULL,
        month          INTEGER NOT NULL,
        row_count      INTEGER NOT NULL,
        rejected_count INTEGER NOT NULL,
        loaded_at      TEXT    NOT NULL,
        run_id         TEXT    NOT NULL
    );
"#;

const INSERT_TRIP: &str = r#"
    INSERT INTO trips (
        batch_key, row_index, period_year, period_month, vendor_id, pickup_at, dropoff_at,
        passenger_count, trip_distance, ratecode_id, store_and_fwd_flag, pickup_location,
        dropoff_location, payment_type, fare_amount, extra, mta_tax, tip_amount, tolls_amount,
        improvement_surcharge, total_amount, congestion_surcharge, airport_fee, cbd_congestion_fee
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
              ?19, ?20, ?21, ?22, ?23, ?24)
"#;

const SELECT_BATCH: &str = "SELECT batch_key, year, month, row_count, rejected_count, loaded_at, run_id
                            FROM load_log";

/// Accepted records streamed into a batch write, plus how many were rejected
/// along the way.
pub trait RecordSource: Iterator<Item = Result<TripRecord>> {
    fn rejected(&self) -> u64;
}

#[derive(Debug)]
pub enum WriteOutcome {
    Loaded(LoadedBatch),
    /// The batch already had a marker and no reload was requested.
    AlreadyLoaded(LoadedBatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreStatistics {
    pub total_trips: u64,
    pub batches_loaded: u64,
    pub first_pickup: Option<NaiveDateTime>,
    pub last_pickup: Option<NaiveDateTime>,
    pub database_bytes: u64,
}

pub struct TripStore {
    conn: Connection,
    path: PathBuf,
}

impl TripStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "opened trip store");
        Ok(Self { conn, path: path.to_path_buf() })
    }

    /// Open a store some earlier load created. Never creates the file or
    /// its tables, so a mistyped path is an error rather than an empty store.
    pub fn open_existing(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let missing = |reason: &str| IngestError::StoreNotFound {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };
        if !path.is_file() {
            return Err(missing("file does not exist"));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('trips', 'load_log')",
            [],
            |row| row.get(0),
        )?;
        if tables != 2 {
            return Err(missing("not a trip store"));
        }
        debug!(path = %path.display(), "opened existing trip store");
        Ok(Self { conn, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn batch(&self, batch_key: &str) -> Result<Option<LoadedBatch>> {
        read_batch(&self.conn, batch_key)
    }

    pub fn is_loaded(&self, batch_key: &str) -> Result<bool> {
        Ok(self.batch(batch_key)?.is_some())
    }

    /// All markers, ordered by batch key.
    pub fn batches(&self) -> Result<Vec<LoadedBatch>> {
        let mut stmt = self.conn.prepare(&format!("{} ORDER BY batch_key", SELECT_BATCH))?;
        let rows = stmt.query_map([], batch_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Write one batch atomically.
    ///
    /// Inside one `IMMEDIATE` transaction: check the marker, delete any rows
    /// already stored under `batch_key`, stream `records` in, record the
    /// marker, commit. Any error rolls everything back.
    pub fn replace_batch<S>(
        &mut self,
        batch_key: &str,
        identifier: DatasetIdentifier,
        run_id: &str,
        force: bool,
        records: &mut S,
    ) -> Result<WriteOutcome>
    where
        S: RecordSource + ?Sized,
    {
        let store_err = |source: rusqlite::Error| IngestError::StoreWrite {
            batch_key: batch_key.to_string(),
            source,
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;

        if let Some(existing) = read_batch(&tx, batch_key)? {
            if !force {
                return Ok(WriteOutcome::AlreadyLoaded(existing));
            }
        }

        let replaced_rows = tx
            .execute("DELETE FROM trips WHERE batch_key = ?1", params![batch_key])
            .map_err(store_err)? as u64;
        tx.execute("DELETE FROM load_log WHERE batch_key = ?1", params![batch_key])
            .map_err(store_err)?;
        if replaced_rows > 0 {
            info!(batch_key, replaced_rows, "removed previously stored rows");
        }

        let mut row_count: u64 = 0;
        {
            let mut stmt = tx.prepare_cached(INSERT_TRIP).map_err(store_err)?;
            for record in &mut *records {
                insert_trip(&mut stmt, batch_key, &record?).map_err(store_err)?;
                row_count += 1;
            }
        }

        let batch = LoadedBatch {
            batch_key: batch_key.to_string(),
            identifier,
            row_count,
            rejected_count: records.rejected(),
            replaced_rows,
            loaded_at: Utc::now(),
            run_id: run_id.to_string(),
        };
        tx.execute(
            "INSERT INTO load_log (batch_key, year, month, row_count, rejected_count, loaded_at, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                batch.batch_key,
                batch.identifier.year(),
                batch.identifier.month(),
                batch.row_count as i64,
                batch.rejected_count as i64,
                batch.loaded_at.to_rfc3339(),
                batch.run_id,
            ],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;

        Ok(WriteOutcome::Loaded(batch))
    }

    pub fn row_count(&self, batch_key: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM trips WHERE batch_key = ?1",
            params![batch_key],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Stored trips per period, oldest first.
    pub fn period_counts(&self) -> Result<Vec<(Period, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT period_year, period_month, COUNT(*) FROM trips
             GROUP BY period_year, period_month
             ORDER BY period_year, period_month",
        )?;
        let rows = stmt.query_map([], |row| {
            let period = Period { year: row.get(0)?, month: row.get(1)? };
            let count: i64 = row.get(2)?;
            Ok((period, count as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let total_trips: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM trips", [], |row| row.get(0))?;
        let batches_loaded: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM load_log", [], |row| row.get(0))?;
        let (first, last): (Option<String>, Option<String>) = self.conn.query_row(
            "SELECT MIN(pickup_at), MAX(pickup_at) FROM trips",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let database_bytes: i64 = self.conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStatistics {
            total_trips: total_trips as u64,
            batches_loaded: batches_loaded as u64,
            first_pickup: first.and_then(|s| NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT).ok()),
            last_pickup: last.and_then(|s| NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT).ok()),
            database_bytes: database_bytes as u64,
        })
    }
}

fn read_batch(conn: &Connection, batch_key: &str) -> Result<Option<LoadedBatch>> {
    let batch = conn
        .query_row(
            &format!("{} WHERE batch_key = ?1", SELECT_BATCH),
            params![batch_key],
            batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LoadedBatch> {
    let year: i32 = row.get(1)?;
    let month: u32 = row.get(2)?;
    let identifier = DatasetIdentifier::new(year, month)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Integer, Box::new(e)))?;
    let loaded_at: String = row.get(5)?;
    let loaded_at = DateTime::parse_from_rfc3339(&loaded_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    let row_count: i64 = row.get(3)?;
    let rejected_count: i64 = row.get(4)?;
    Ok(LoadedBatch {
        batch_key: row.get(0)?,
        identifier,
        row_count: row_count as u64,
        rejected_count: rejected_count as u64,
        replaced_rows: 0,
        loaded_at,
        run_id: row.get(6)?,
    })
}

fn insert_trip(stmt: &mut CachedStatement<'_>, batch_key: &str, r: &TripRecord) -> rusqlite::Result<()> {
    stmt.execute(params![
        batch_key,
        r.row_index as i64,
        r.period.year,
        r.period.month,
        r.vendor_id,
        r.pickup_at.format(TIMESTAMP_FORMAT).to_string(),
        r.dropoff_at.format(TIMESTAMP_FORMAT).to_string(),
        r.passenger_count,
        r.trip_distance,
        r.ratecode_id,
        r.store_and_fwd_flag,
        r.pickup_location,
        r.dropoff_location,
        r.payment_type,
        r.fare_amount,
        r.extra,
        r.mta_tax,
        r.tip_amount,
        r.tolls_amount,
        r.improvement_surcharge,
        r.total_amount,
        r.congestion_surcharge,
        r.airport_fee,
        r.cbd_congestion_fee,
    ])?;
    Ok(())
}
