#![allow(dead_code)]

use arrow::array::{ArrayRef, Float64Array, Int32Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use nyc_taxi_ingest::app::ports::{HttpClientPort, HttpDownload};
use nyc_taxi_ingest::config::{LoadConfig, StorageConfig};
use nyc_taxi_ingest::error::{IngestError, Result};
use nyc_taxi_ingest::idempotency::sha256_hex;
use nyc_taxi_ingest::pipeline::Loader;
use parquet::arrow::ArrowWriter;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DATASET: &str = "yellow_tripdata";

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, min, 0)
        .unwrap()
}

/// One fixture trip: pickup, dropoff, trip distance.
pub type Trip = (NaiveDateTime, NaiveDateTime, f64);

fn micros(ts: &NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

/// A batch in the 2011+ yellow layout, plus one column no layout knows.
pub fn yellow_batch(trips: &[Trip]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("VendorID", DataType::Int32, true),
        Field::new("tpep_pickup_datetime", DataType::Timestamp(TimeUnit::Microsecond, None), true),
        Field::new("tpep_dropoff_datetime", DataType::Timestamp(TimeUnit::Microsecond, None), true),
        Field::new("trip_distance", DataType::Float64, true),
        Field::new("PULocationID", DataType::Int32, true),
        Field::new("DOLocationID", DataType::Int32, true),
        Field::new("fare_amount", DataType::Float64, true),
        Field::new("Airport_fee", DataType::Float64, true),
        Field::new("driver_mood", DataType::Utf8, true),
    ]));
    let n = trips.len();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(vec![2; n])),
        Arc::new(TimestampMicrosecondArray::from(
            trips.iter().map(|t| micros(&t.0)).collect::<Vec<_>>(),
        )),
        Arc::new(TimestampMicrosecondArray::from(
            trips.iter().map(|t| micros(&t.1)).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(trips.iter().map(|t| t.2).collect::<Vec<_>>())),
        Arc::new(Int32Array::from(vec![161; n])),
        Arc::new(Int32Array::from(vec![237; n])),
        Arc::new(Float64Array::from(vec![12.5; n])),
        Arc::new(Float64Array::from(vec![0.0; n])),
        Arc::new(StringArray::from(vec!["fine"; n])),
    ];
    RecordBatch::try_new(schema, columns).unwrap()
}

/// A batch in the 2009 layout, where timestamps are text.
pub fn yellow_2009_batch(rows: &[(&str, &str)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("vendor_name", DataType::Utf8, true),
        Field::new("Trip_Pickup_DateTime", DataType::Utf8, true),
        Field::new("Trip_Dropoff_DateTime", DataType::Utf8, true),
        Field::new("Passenger_Count", DataType::Int32, true),
        Field::new("Trip_Distance", DataType::Float64, true),
        Field::new("Start_Lon", DataType::Float64, true),
        Field::new("Fare_Amt", DataType::Float64, true),
    ]));
    let n = rows.len();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec!["VTS"; n])),
        Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
        Arc::new(StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
        Arc::new(Int32Array::from(vec![1; n])),
        Arc::new(Float64Array::from(vec![2.6; n])),
        Arc::new(Float64Array::from(vec![-73.99; n])),
        Arc::new(Float64Array::from(vec![8.9; n])),
    ];
    RecordBatch::try_new(schema, columns).unwrap()
}

pub fn parquet_bytes(batch: &RecordBatch) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
    buf
}

pub fn write_parquet(path: &Path, batch: &RecordBatch) {
    std::fs::write(path, parquet_bytes(batch)).unwrap();
}

/// `count` ordinary trips in January 2024.
pub fn january_trips(count: usize) -> Vec<Trip> {
    (0..count)
        .map(|i| {
            let pickup = at(2024, 1, 1 + (i % 28) as u32, 8, (i % 50) as u32);
            (pickup, pickup + chrono::Duration::minutes(12), 1.5 + i as f64)
        })
        .collect()
}

pub fn loader(dir: &Path, force_reload: bool) -> Loader {
    let storage = StorageConfig {
        data_dir: dir.join("raw"),
        database_path: dir.join("taxi.sqlite"),
        ..StorageConfig::default()
    };
    let load = LoadConfig { concurrency: 2, force_reload };
    Loader::new(&storage, &load)
}

#[derive(Clone)]
pub enum FakeResponse {
    Body(Vec<u8>),
    /// Body with an advertised length that does not match it.
    Truncated { body: Vec<u8>, advertised: u64 },
    /// Connection drops after `written` bytes reached the destination.
    Dropped { written: Vec<u8> },
    Status(u16),
    NetworkError,
}

/// In-memory HTTP port. Responses are queued per file name; the last queued
/// response repeats.
#[derive(Default)]
pub struct FakeHttp {
    responses: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
    destinations: Mutex<Vec<PathBuf>>,
    calls: AtomicUsize,
}

impl FakeHttp {
    pub fn respond(&self, file_name: &str, response: FakeResponse) {
        self.responses
            .lock()
            .unwrap()
            .entry(file_name.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every path a body was streamed into, in call order.
    pub fn destinations(&self) -> Vec<PathBuf> {
        self.destinations.lock().unwrap().clone()
    }
}

fn success(body: &[u8], content_length: Option<u64>) -> HttpDownload {
    HttpDownload {
        status: 200,
        content_type: "binary/octet-stream".into(),
        content_length,
        etag: Some("\"fixture\"".into()),
        last_modified: None,
        bytes_written: body.len() as u64,
        sha256: sha256_hex(body),
    }
}

fn status_only(status: u16) -> HttpDownload {
    HttpDownload {
        status,
        content_type: "application/xml".into(),
        content_length: None,
        etag: None,
        last_modified: None,
        bytes_written: 0,
        sha256: String::new(),
    }
}

#[async_trait]
impl HttpClientPort for FakeHttp {
    async fn download(&self, url: &str, dest: &Path) -> Result<HttpDownload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let file_name = url.rsplit('/').next().unwrap_or(url).to_string();
        let response = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&file_name) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        let network = || IngestError::Network {
            url: url.to_string(),
            message: "connection reset".into(),
        };
        match response {
            Some(FakeResponse::Body(body)) => {
                self.write(dest, &body).await?;
                Ok(success(&body, Some(body.len() as u64)))
            }
            Some(FakeResponse::Truncated { body, advertised }) => {
                self.write(dest, &body).await?;
                Ok(success(&body, Some(advertised)))
            }
            Some(FakeResponse::Dropped { written }) => {
                self.write(dest, &written).await?;
                Err(network())
            }
            Some(FakeResponse::Status(status)) => Ok(status_only(status)),
            Some(FakeResponse::NetworkError) => Err(network()),
            None => Ok(status_only(404)),
        }
    }
}

impl FakeHttp {
    async fn write(&self, dest: &Path, body: &[u8]) -> Result<()> {
        self.destinations.lock().unwrap().push(dest.to_path_buf());
        tokio::fs::write(dest, body).await?;
        Ok(())
    }
}
