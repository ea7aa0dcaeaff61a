use crate::constants::{FIRST_PUBLISHED_YEAR, PARQUET_EXTENSION};
use crate::error::{IngestError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})$").expect("valid identifier pattern"));

/// One published source file, selected by year and month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetIdentifier {
    year: i32,
    month: u32,
}

impl DatasetIdentifier {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        Self::new_as_of(year, month, Utc::now().date_naive())
    }

    /// Validate against the published range as seen on `today`.
    pub fn new_as_of(year: i32, month: u32, today: NaiveDate) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(IngestError::InvalidIdentifier(format!(
                "month {} is outside 1..=12",
                month
            )));
        }
        if year < FIRST_PUBLISHED_YEAR || year > today.year() {
            return Err(IngestError::InvalidIdentifier(format!(
                "year {} is outside the published range {}..={}",
                year,
                FIRST_PUBLISHED_YEAR,
                today.year()
            )));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    fn successor(&self) -> (i32, u32) {
        if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        }
    }

    /// Every identifier from `from` to `to`, both inclusive.
    pub fn range(from: Self, to: Self) -> Result<Vec<Self>> {
        if from > to {
            return Err(IngestError::InvalidIdentifier(format!(
                "range start {} is after range end {}",
                from, to
            )));
        }
        let mut out = vec![from];
        let mut current = from;
        while current < to {
            let (year, month) = current.successor();
            current = Self { year, month };
            out.push(current);
        }
        Ok(out)
    }

    /// All months of `year` that can be published as of `today`.
    pub fn available_in_year(year: i32, today: NaiveDate) -> Result<Vec<Self>> {
        let last_month = if year == today.year() { today.month() } else { 12 };
        (1..=last_month)
            .map(|month| Self::new_as_of(year, month, today))
            .collect()
    }

    /// Deterministic local/remote file name, e.g. `yellow_tripdata_2024-01.parquet`.
    pub fn file_name(&self, dataset: &str) -> String {
        format!("{}_{}.{}", dataset, self, PARQUET_EXTENSION)
    }

    /// Inverse of [`DatasetIdentifier::file_name`]; `None` for foreign names.
    pub fn from_file_name(name: &str, dataset: &str) -> Option<Self> {
        let rest = name.strip_prefix(dataset)?.strip_prefix('_')?;
        let stem = rest.strip_suffix(PARQUET_EXTENSION)?.strip_suffix('.')?;
        stem.parse().ok()
    }
}

impl fmt::Display for DatasetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for DatasetIdentifier {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = IDENTIFIER_RE
            .captures(s.trim())
            .ok_or_else(|| IngestError::InvalidIdentifier(format!("expected YYYY-MM, got '{}'", s)))?;
        let year: i32 = caps[1]
            .parse()
            .map_err(|_| IngestError::InvalidIdentifier(s.to_string()))?;
        let month: u32 = caps[2]
            .parse()
            .map_err(|_| IngestError::InvalidIdentifier(s.to_string()))?;
        Self::new(year, month)
    }
}

/// The (year, month) a trip is filed under. Always derived from the pickup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn of(timestamp: &NaiveDateTime) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// One normalized trip row. Optional fields are `None` when the source
/// revision lacks the column or the value is null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub row_index: u64,
    pub pickup_at: NaiveDateTime,
    pub dropoff_at: NaiveDateTime,
    pub period: Period,
    pub vendor_id: Option<i64>,
    pub passenger_count: Option<f64>,
    pub trip_distance: Option<f64>,
    pub ratecode_id: Option<i64>,
    pub store_and_fwd_flag: Option<String>,
    pub pickup_location: Option<i64>,
    pub dropoff_location: Option<i64>,
    pub payment_type: Option<i64>,
    pub fare_amount: Option<f64>,
    pub extra: Option<f64>,
    pub mta_tax: Option<f64>,
    pub tip_amount: Option<f64>,
    pub tolls_amount: Option<f64>,
    pub improvement_surcharge: Option<f64>,
    pub total_amount: Option<f64>,
    pub congestion_surcharge: Option<f64>,
    pub airport_fee: Option<f64>,
    pub cbd_congestion_fee: Option<f64>,
}

impl TripRecord {
    /// A record with only the required fields set.
    pub fn new(row_index: u64, pickup_at: NaiveDateTime, dropoff_at: NaiveDateTime) -> Self {
        Self {
            row_index,
            pickup_at,
            dropoff_at,
            period: Period::of(&pickup_at),
            vendor_id: None,
            passenger_count: None,
            trip_distance: None,
            ratecode_id: None,
            store_and_fwd_flag: None,
            pickup_location: None,
            dropoff_location: None,
            payment_type: None,
            fare_amount: None,
            extra: None,
            mta_tax: None,
            tip_amount: None,
            tolls_amount: None,
            improvement_surcharge: None,
            total_amount: None,
            congestion_surcharge: None,
            airport_fee: None,
            cbd_congestion_fee: None,
        }
    }
}

/// Why a source row was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingPickup,
    MissingDropoff,
    UnparseableTimestamp,
    DropoffBeforePickup,
    PickupOutOfRange,
    NegativeDistance,
    NegativePassengerCount,
    InvalidLocation,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingPickup => "missing_pickup",
            RejectReason::MissingDropoff => "missing_dropoff",
            RejectReason::UnparseableTimestamp => "unparseable_timestamp",
            RejectReason::DropoffBeforePickup => "dropoff_before_pickup",
            RejectReason::PickupOutOfRange => "pickup_out_of_range",
            RejectReason::NegativeDistance => "negative_distance",
            RejectReason::NegativePassengerCount => "negative_passenger_count",
            RejectReason::InvalidLocation => "invalid_location",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping marker for one fully stored source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedBatch {
    pub batch_key: String,
    pub identifier: DatasetIdentifier,
    pub row_count: u64,
    pub rejected_count: u64,
    /// Rows removed from a previous load of the same batch (force reload or
    /// leftovers of an interrupted run).
    pub replaced_rows: u64,
    pub loaded_at: DateTime<Utc>,
    pub run_id: String,
}
