use crate::constants::{FIRST_PUBLISHED_YEAR, READ_BATCH_SIZE};
use crate::error::{IngestError, Result};
use crate::pipeline::schema::{self, CanonicalField, FieldKind, ResolvedSchema};
use crate::storage::RecordSource;
use crate::types::{RejectReason, TripRecord};
use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type, TimeUnit, TimestampMicrosecondType};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDateTime, Utc};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

use crate::pipeline::schema::CanonicalField as F;

// Text layouts seen in early TLC files
const TEXT_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
];

pub fn parse_text_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    TEXT_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// A source column coerced to its canonical type.
enum Column {
    Timestamp(TimestampMicrosecondArray),
    TimestampText(StringArray),
    Integer(Int64Array),
    Float(Float64Array),
    Text(StringArray),
}

struct DecodedBatch {
    columns: HashMap<CanonicalField, Column>,
    rows: usize,
}

impl DecodedBatch {
    fn timestamp(&self, field: CanonicalField, row: usize) -> std::result::Result<Option<NaiveDateTime>, RejectReason> {
        match self.columns.get(&field) {
            Some(Column::Timestamp(arr)) => {
                if arr.is_null(row) {
                    return Ok(None);
                }
                arr.value_as_datetime(row)
                    .map(Some)
                    .ok_or(RejectReason::UnparseableTimestamp)
            }
            Some(Column::TimestampText(arr)) => {
                if arr.is_null(row) || arr.value(row).trim().is_empty() {
                    return Ok(None);
                }
                parse_text_timestamp(arr.value(row))
                    .map(Some)
                    .ok_or(RejectReason::UnparseableTimestamp)
            }
            _ => Ok(None),
        }
    }

    fn integer(&self, field: CanonicalField, row: usize) -> Option<i64> {
        match self.columns.get(&field) {
            Some(Column::Integer(arr)) if !arr.is_null(row) => Some(arr.value(row)),
            _ => None,
        }
    }

    fn float(&self, field: CanonicalField, row: usize) -> Option<f64> {
        match self.columns.get(&field) {
            Some(Column::Float(arr)) if !arr.is_null(row) => {
                Some(arr.value(row)).filter(|v| v.is_finite())
            }
            _ => None,
        }
    }

    fn text(&self, field: CanonicalField, row: usize) -> Option<String> {
        match self.columns.get(&field) {
            Some(Column::Text(arr)) if !arr.is_null(row) => {
                let v = arr.value(row).trim();
                (!v.is_empty()).then(|| v.to_string())
            }
            _ => None,
        }
    }
}

/// Streams normalized [`TripRecord`]s out of one Parquet file.
///
/// Malformed rows are skipped and tallied per [`RejectReason`]; only a
/// decoding failure of the file itself surfaces as an `Err` item.
pub struct TripReader {
    file_name: String,
    schema: ResolvedSchema,
    batches: ParquetRecordBatchReader,
    current: Option<DecodedBatch>,
    cursor: usize,
    next_row_index: u64,
    accepted: u64,
    rejections: BTreeMap<RejectReason, u64>,
    max_pickup_year: i32,
}

impl TripReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let resolved = schema::resolve(builder.schema()).ok_or_else(|| IngestError::SchemaMismatch {
            file: file_name.clone(),
            reason: "no known layout has both pickup and dropoff timestamp columns".into(),
        })?;
        for (field, idx) in &resolved.columns {
            if field.kind() == FieldKind::Timestamp {
                let data_type = builder.schema().field(*idx).data_type();
                if !is_timestamp_source(data_type) {
                    return Err(IngestError::SchemaMismatch {
                        file: file_name.clone(),
                        reason: format!("{:?} column has unsupported type {}", field, data_type),
                    });
                }
            }
        }
        if !resolved.dropped.is_empty() {
            info!(file = %file_name, dropped = ?resolved.dropped, "dropping unrecognized columns");
        }
        debug!(file = %file_name, revision = resolved.revision, rows = builder.metadata().file_metadata().num_rows(), "opened source file");

        let batches = builder.with_batch_size(READ_BATCH_SIZE).build()?;
        Ok(Self {
            file_name,
            schema: resolved,
            batches,
            current: None,
            cursor: 0,
            next_row_index: 0,
            accepted: 0,
            rejections: BTreeMap::new(),
            max_pickup_year: Utc::now().year() + 1,
        })
    }

    pub fn revision(&self) -> &'static str {
        self.schema.revision
    }

    pub fn dropped_columns(&self) -> &[String] {
        &self.schema.dropped
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn rejections(&self) -> &BTreeMap<RejectReason, u64> {
        &self.rejections
    }

    fn decode(&self, batch: &RecordBatch) -> Result<DecodedBatch> {
        let mut columns = HashMap::with_capacity(self.schema.columns.len());
        for (field, idx) in &self.schema.columns {
            let column = decode_column(field.kind(), batch.column(*idx)).map_err(|e| match e {
                IngestError::SchemaMismatch { reason, .. } => IngestError::SchemaMismatch {
                    file: self.file_name.clone(),
                    reason: format!("{:?}: {}", field, reason),
                },
                other => other,
            })?;
            columns.insert(*field, column);
        }
        Ok(DecodedBatch { columns, rows: batch.num_rows() })
    }
}

fn is_timestamp_source(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 | DataType::Utf8 | DataType::LargeUtf8
    )
}

fn decode_column(kind: FieldKind, array: &ArrayRef) -> Result<Column> {
    let column = match kind {
        FieldKind::Timestamp => match array.data_type() {
            DataType::Utf8 | DataType::LargeUtf8 => {
                let text = cast(array, &DataType::Utf8)?;
                Column::TimestampText(text.as_string::<i32>().clone())
            }
            DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
                let ts = cast(array, &DataType::Timestamp(TimeUnit::Microsecond, None))?;
                Column::Timestamp(ts.as_primitive::<TimestampMicrosecondType>().clone())
            }
            other => {
                return Err(IngestError::SchemaMismatch {
                    file: String::new(),
                    reason: format!("unsupported timestamp type {}", other),
                })
            }
        },
        FieldKind::Integer => {
            let ints = cast(array, &DataType::Int64)?;
            Column::Integer(ints.as_primitive::<Int64Type>().clone())
        }
        FieldKind::Float => {
            let floats = cast(array, &DataType::Float64)?;
            Column::Float(floats.as_primitive::<Float64Type>().clone())
        }
        FieldKind::Text => {
            let text = cast(array, &DataType::Utf8)?;
            Column::Text(text.as_string::<i32>().clone())
        }
    };
    Ok(column)
}

/// Normalize one row, or say why it is rejected.
fn build_record(
    batch: &DecodedBatch,
    row: usize,
    row_index: u64,
    max_pickup_year: i32,
) -> std::result::Result<TripRecord, RejectReason> {
    let pickup_at = batch.timestamp(F::PickupAt, row)?.ok_or(RejectReason::MissingPickup)?;
    let dropoff_at = batch.timestamp(F::DropoffAt, row)?.ok_or(RejectReason::MissingDropoff)?;
    if dropoff_at < pickup_at {
        return Err(RejectReason::DropoffBeforePickup);
    }
    if pickup_at.year() < FIRST_PUBLISHED_YEAR || pickup_at.year() > max_pickup_year {
        return Err(RejectReason::PickupOutOfRange);
    }

    let mut record = TripRecord::new(row_index, pickup_at, dropoff_at);
    record.vendor_id = batch.integer(F::VendorId, row);
    record.passenger_count = batch.float(F::PassengerCount, row);
    record.trip_distance = batch.float(F::TripDistance, row);
    record.ratecode_id = batch.integer(F::RatecodeId, row);
    record.store_and_fwd_flag = batch.text(F::StoreAndFwdFlag, row);
    record.pickup_location = batch.integer(F::PickupLocation, row);
    record.dropoff_location = batch.integer(F::DropoffLocation, row);
    record.payment_type = batch.integer(F::PaymentType, row);
    record.fare_amount = batch.float(F::FareAmount, row);
    record.extra = batch.float(F::Extra, row);
    record.mta_tax = batch.float(F::MtaTax, row);
    record.tip_amount = batch.float(F::TipAmount, row);
    record.tolls_amount = batch.float(F::TollsAmount, row);
    record.improvement_surcharge = batch.float(F::ImprovementSurcharge, row);
    record.total_amount = batch.float(F::TotalAmount, row);
    record.congestion_surcharge = batch.float(F::CongestionSurcharge, row);
    record.airport_fee = batch.float(F::AirportFee, row);
    record.cbd_congestion_fee = batch.float(F::CbdCongestionFee, row);

    if record.trip_distance.is_some_and(|d| d < 0.0) {
        return Err(RejectReason::NegativeDistance);
    }
    if record.passenger_count.is_some_and(|p| p < 0.0) {
        return Err(RejectReason::NegativePassengerCount);
    }
    if record.pickup_location.is_some_and(|l| l <= 0) || record.dropoff_location.is_some_and(|l| l <= 0) {
        return Err(RejectReason::InvalidLocation);
    }
    Ok(record)
}

impl Iterator for TripReader {
    type Item = Result<TripRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let exhausted = self.current.as_ref().map_or(true, |b| self.cursor >= b.rows);
            if exhausted {
                let batch = match self.batches.next()? {
                    Ok(batch) => batch,
                    Err(e) => return Some(Err(e.into())),
                };
                match self.decode(&batch) {
                    Ok(decoded) => {
                        self.current = Some(decoded);
                        self.cursor = 0;
                    }
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }

            let Some(batch) = self.current.as_ref() else {
                return None;
            };
            let row = self.cursor;
            let row_index = self.next_row_index;
            let outcome = build_record(batch, row, row_index, self.max_pickup_year);
            self.cursor += 1;
            self.next_row_index += 1;

            match outcome {
                Ok(record) => {
                    self.accepted += 1;
                    return Some(Ok(record));
                }
                Err(reason) => {
                    debug!(file = %self.file_name, row_index, %reason, "rejecting row");
                    *self.rejections.entry(reason).or_insert(0) += 1;
                }
            }
        }
    }
}

impl RecordSource for TripReader {
    fn rejected(&self) -> u64 {
        self.rejections.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::TimestampMicrosecondArray;
    use arrow::datatypes::{Field, Schema};
    use chrono::NaiveDate;
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn micros(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    fn write(path: &Path, batch: RecordBatch) {
        let file = File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_parse_text_timestamp_formats() {
        assert!(parse_text_timestamp("2009-01-04 02:52:00").is_some());
        assert!(parse_text_timestamp("2009-01-04T02:52:00").is_some());
        assert!(parse_text_timestamp(" 01/04/2009 02:52:00 ").is_some());
        assert!(parse_text_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_reads_modern_layout_and_validates_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2024-01.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("VendorID", DataType::Int32, true),
            Field::new("tpep_pickup_datetime", DataType::Timestamp(TimeUnit::Microsecond, None), true),
            Field::new("tpep_dropoff_datetime", DataType::Timestamp(TimeUnit::Microsecond, None), true),
            Field::new("trip_distance", DataType::Float64, true),
            Field::new("PULocationID", DataType::Int32, true),
            Field::new("DOLocationID", DataType::Int32, true),
            Field::new("fare_amount", DataType::Float64, true),
            Field::new("mystery", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(arrow::array::Int32Array::from(vec![Some(1), Some(2), None, Some(2)])),
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(micros(2024, 1, 31, 23, 50)),
                    Some(micros(2024, 2, 1, 0, 5)),
                    None,
                    Some(micros(2024, 1, 10, 8, 0)),
                ])),
                Arc::new(TimestampMicrosecondArray::from(vec![
                    Some(micros(2024, 2, 1, 0, 10)),
                    Some(micros(2024, 2, 1, 0, 20)),
                    Some(micros(2024, 1, 5, 9, 0)),
                    Some(micros(2024, 1, 10, 7, 0)),
                ])),
                Arc::new(Float64Array::from(vec![Some(2.5), Some(1.0), Some(1.0), Some(3.0)])),
                Arc::new(arrow::array::Int32Array::from(vec![Some(132), Some(48), Some(1), Some(1)])),
                Arc::new(arrow::array::Int32Array::from(vec![Some(236), None, Some(1), Some(1)])),
                Arc::new(Float64Array::from(vec![Some(52.0), None, Some(5.0), Some(9.0)])),
                Arc::new(StringArray::from(vec!["a", "b", "c", "d"])),
            ],
        )
        .unwrap();
        write(&path, batch);

        let mut reader = TripReader::open(&path).unwrap();
        assert_eq!(reader.revision(), "yellow_2011");
        assert_eq!(reader.dropped_columns(), &["mystery".to_string()]);

        let records: Vec<TripRecord> = reader.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(reader.accepted(), 2);
        assert_eq!(reader.rejected(), 2);
        assert_eq!(reader.rejections().get(&RejectReason::MissingPickup), Some(&1));
        assert_eq!(reader.rejections().get(&RejectReason::DropoffBeforePickup), Some(&1));

        // Row provenance survives skipped rows
        assert_eq!(records[0].row_index, 0);
        assert_eq!(records[1].row_index, 1);
        assert_eq!(records[0].period.month, 1);
        assert_eq!(records[1].period.month, 2);
        assert_eq!(records[0].vendor_id, Some(1));
        assert_eq!(records[0].pickup_location, Some(132));
        assert_eq!(records[1].dropoff_location, None);
        assert_eq!(records[1].fare_amount, None);
        assert_eq!(records[0].airport_fee, None);
    }

    #[test]
    fn test_reads_text_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2009-01.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("vendor_name", DataType::Utf8, true),
            Field::new("Trip_Pickup_DateTime", DataType::Utf8, true),
            Field::new("Trip_Dropoff_DateTime", DataType::Utf8, true),
            Field::new("Passenger_Count", DataType::Int64, true),
            Field::new("Fare_Amt", DataType::Float64, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["VTS", "CMT", "VTS"])),
                Arc::new(StringArray::from(vec!["2009-01-04 02:52:00", "garbage", "2009-01-31 23:59:00"])),
                Arc::new(StringArray::from(vec!["2009-01-04 03:02:00", "2009-01-04 03:02:00", "2009-02-01 00:10:00"])),
                Arc::new(Int64Array::from(vec![1, 2, -1])),
                Arc::new(Float64Array::from(vec![8.9, 4.0, 5.0])),
            ],
        )
        .unwrap();
        write(&path, batch);

        let mut reader = TripReader::open(&path).unwrap();
        assert_eq!(reader.revision(), "yellow_2009");
        let records: Vec<TripRecord> = reader.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        // Non-numeric vendor names fall back to NULL
        assert_eq!(records[0].vendor_id, None);
        assert_eq!(records[0].passenger_count, Some(1.0));
        assert_eq!(reader.rejections().get(&RejectReason::UnparseableTimestamp), Some(&1));
        assert_eq!(reader.rejections().get(&RejectReason::NegativePassengerCount), Some(&1));
    }

    #[test]
    fn test_unknown_layout_is_schema_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2024-01.parquet");
        let schema = Arc::new(Schema::new(vec![Field::new("fare", DataType::Float64, true)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(vec![1.0]))]).unwrap();
        write(&path, batch);

        match TripReader::open(&path) {
            Err(IngestError::SchemaMismatch { .. }) => {}
            other => panic!("expected schema mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_not_parquet_is_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("yellow_tripdata_2024-01.parquet");
        std::fs::write(&path, b"<html>oops</html>").unwrap();
        assert!(matches!(TripReader::open(&path), Err(IngestError::Parquet(_))));
    }
}
