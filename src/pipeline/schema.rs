//! Known TLC source layouts and their mapping onto [`TripRecord`] fields.
//!
//! The TLC has renamed and added columns several times since 2009. Each
//! revision is a row in [`SCHEMA_REVISIONS`]; supporting a new layout means
//! adding a table entry, not new parsing code.
//!
//! [`TripRecord`]: crate::types::TripRecord

use arrow::datatypes::Schema;
use std::collections::HashMap;

/// Canonical trip fields a source column can map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanonicalField {
    VendorId,
    PickupAt,
    DropoffAt,
    PassengerCount,
    TripDistance,
    RatecodeId,
    StoreAndFwdFlag,
    PickupLocation,
    DropoffLocation,
    PaymentType,
    FareAmount,
    Extra,
    MtaTax,
    TipAmount,
    TollsAmount,
    ImprovementSurcharge,
    TotalAmount,
    CongestionSurcharge,
    AirportFee,
    CbdCongestionFee,
}

/// Target type a source column is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Timestamp,
    Integer,
    Float,
    Text,
}

impl CanonicalField {
    pub fn kind(&self) -> FieldKind {
        use CanonicalField::*;
        match self {
            PickupAt | DropoffAt => FieldKind::Timestamp,
            VendorId | RatecodeId | PickupLocation | DropoffLocation | PaymentType => {
                FieldKind::Integer
            }
            StoreAndFwdFlag => FieldKind::Text,
            PassengerCount | TripDistance | FareAmount | Extra | MtaTax | TipAmount
            | TollsAmount | ImprovementSurcharge | TotalAmount | CongestionSurcharge
            | AirportFee | CbdCongestionFee => FieldKind::Float,
        }
    }
}

/// One published source layout.
#[derive(Debug)]
pub struct SchemaRevision {
    pub name: &'static str,
    /// Source column name (matched case-insensitively) to canonical field.
    pub columns: &'static [(&'static str, CanonicalField)],
}

use CanonicalField as F;

const YELLOW_2009: SchemaRevision = SchemaRevision {
    name: "yellow_2009",
    columns: &[
        ("vendor_name", F::VendorId),
        ("Trip_Pickup_DateTime", F::PickupAt),
        ("Trip_Dropoff_DateTime", F::DropoffAt),
        ("Passenger_Count", F::PassengerCount),
        ("Trip_Distance", F::TripDistance),
        ("Rate_Code", F::RatecodeId),
        ("store_and_forward", F::StoreAndFwdFlag),
        ("Payment_Type", F::PaymentType),
        ("Fare_Amt", F::FareAmount),
        ("surcharge", F::Extra),
        ("mta_tax", F::MtaTax),
        ("Tip_Amt", F::TipAmount),
        ("Tolls_Amt", F::TollsAmount),
        ("Total_Amt", F::TotalAmount),
    ],
};

const YELLOW_2010: SchemaRevision = SchemaRevision {
    name: "yellow_2010",
    columns: &[
        ("vendor_id", F::VendorId),
        ("pickup_datetime", F::PickupAt),
        ("dropoff_datetime", F::DropoffAt),
        ("passenger_count", F::PassengerCount),
        ("trip_distance", F::TripDistance),
        ("rate_code", F::RatecodeId),
        ("store_and_fwd_flag", F::StoreAndFwdFlag),
        ("payment_type", F::PaymentType),
        ("fare_amount", F::FareAmount),
        ("surcharge", F::Extra),
        ("mta_tax", F::MtaTax),
        ("tip_amount", F::TipAmount),
        ("tolls_amount", F::TollsAmount),
        ("total_amount", F::TotalAmount),
    ],
};

const YELLOW_2011: SchemaRevision = SchemaRevision {
    name: "yellow_2011",
    columns: &[
        ("VendorID", F::VendorId),
        ("tpep_pickup_datetime", F::PickupAt),
        ("tpep_dropoff_datetime", F::DropoffAt),
        ("passenger_count", F::PassengerCount),
        ("trip_distance", F::TripDistance),
        ("RatecodeID", F::RatecodeId),
        ("store_and_fwd_flag", F::StoreAndFwdFlag),
        ("PULocationID", F::PickupLocation),
        ("DOLocationID", F::DropoffLocation),
        ("payment_type", F::PaymentType),
        ("fare_amount", F::FareAmount),
        ("extra", F::Extra),
        ("mta_tax", F::MtaTax),
        ("tip_amount", F::TipAmount),
        ("tolls_amount", F::TollsAmount),
        ("improvement_surcharge", F::ImprovementSurcharge),
        ("total_amount", F::TotalAmount),
        ("congestion_surcharge", F::CongestionSurcharge),
        ("Airport_fee", F::AirportFee),
        ("cbd_congestion_fee", F::CbdCongestionFee),
    ],
};

const GREEN_2013: SchemaRevision = SchemaRevision {
    name: "green_2013",
    columns: &[
        ("VendorID", F::VendorId),
        ("lpep_pickup_datetime", F::PickupAt),
        ("lpep_dropoff_datetime", F::DropoffAt),
        ("store_and_fwd_flag", F::StoreAndFwdFlag),
        ("RatecodeID", F::RatecodeId),
        ("PULocationID", F::PickupLocation),
        ("DOLocationID", F::DropoffLocation),
        ("passenger_count", F::PassengerCount),
        ("trip_distance", F::TripDistance),
        ("fare_amount", F::FareAmount),
        ("extra", F::Extra),
        ("mta_tax", F::MtaTax),
        ("tip_amount", F::TipAmount),
        ("tolls_amount", F::TollsAmount),
        ("improvement_surcharge", F::ImprovementSurcharge),
        ("total_amount", F::TotalAmount),
        ("payment_type", F::PaymentType),
        ("congestion_surcharge", F::CongestionSurcharge),
        ("cbd_congestion_fee", F::CbdCongestionFee),
    ],
};

pub static SCHEMA_REVISIONS: &[SchemaRevision] = &[YELLOW_2011, GREEN_2013, YELLOW_2010, YELLOW_2009];

/// A revision bound to the column positions of one concrete file.
#[derive(Debug)]
pub struct ResolvedSchema {
    pub revision: &'static str,
    pub columns: HashMap<CanonicalField, usize>,
    /// Source columns no canonical field claims.
    pub dropped: Vec<String>,
}

impl ResolvedSchema {
    pub fn index_of(&self, field: CanonicalField) -> Option<usize> {
        self.columns.get(&field).copied()
    }
}

impl SchemaRevision {
    fn bind(&'static self, schema: &Schema) -> Option<ResolvedSchema> {
        let mut columns = HashMap::new();
        for (source_name, field) in self.columns {
            let position = schema
                .fields()
                .iter()
                .position(|f| f.name().eq_ignore_ascii_case(source_name));
            if let Some(idx) = position {
                columns.entry(*field).or_insert(idx);
            }
        }
        if !columns.contains_key(&F::PickupAt) || !columns.contains_key(&F::DropoffAt) {
            return None;
        }

        let claimed: Vec<usize> = columns.values().copied().collect();
        let dropped = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed.contains(i))
            .map(|(_, f)| f.name().clone())
            .collect();
        Some(ResolvedSchema { revision: self.name, columns, dropped })
    }
}

/// Pick the revision that has both timestamp columns and claims the most
/// source columns. Ties go to the earlier table entry.
pub fn resolve(schema: &Schema) -> Option<ResolvedSchema> {
    let mut best: Option<ResolvedSchema> = None;
    for revision in SCHEMA_REVISIONS {
        if let Some(candidate) = revision.bind(schema) {
            let better = best
                .as_ref()
                .map_or(true, |b| candidate.columns.len() > b.columns.len());
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, TimeUnit};

    fn schema(cols: &[(&str, DataType)]) -> Schema {
        Schema::new(
            cols.iter()
                .map(|(n, t)| Field::new(*n, t.clone(), true))
                .collect::<Vec<_>>(),
        )
    }

    fn ts() -> DataType {
        DataType::Timestamp(TimeUnit::Microsecond, None)
    }

    #[test]
    fn test_resolves_modern_yellow_layout() {
        let s = schema(&[
            ("VendorID", DataType::Int32),
            ("tpep_pickup_datetime", ts()),
            ("tpep_dropoff_datetime", ts()),
            ("PULocationID", DataType::Int32),
            ("DOLocationID", DataType::Int32),
            ("fare_amount", DataType::Float64),
            ("airport_fee", DataType::Float64),
        ]);
        let resolved = resolve(&s).unwrap();
        assert_eq!(resolved.revision, "yellow_2011");
        assert_eq!(resolved.index_of(F::PickupLocation), Some(3));
        // Matches Airport_fee despite the lower-case spelling
        assert_eq!(resolved.index_of(F::AirportFee), Some(6));
        assert_eq!(resolved.index_of(F::CbdCongestionFee), None);
        assert!(resolved.dropped.is_empty());
    }

    #[test]
    fn test_resolves_2009_layout() {
        let s = schema(&[
            ("vendor_name", DataType::Utf8),
            ("Trip_Pickup_DateTime", DataType::Utf8),
            ("Trip_Dropoff_DateTime", DataType::Utf8),
            ("Passenger_Count", DataType::Int64),
            ("Fare_Amt", DataType::Float64),
            ("Start_Lon", DataType::Float64),
        ]);
        let resolved = resolve(&s).unwrap();
        assert_eq!(resolved.revision, "yellow_2009");
        assert_eq!(resolved.index_of(F::FareAmount), Some(4));
        assert_eq!(resolved.index_of(F::PickupLocation), None);
        assert_eq!(resolved.dropped, vec!["Start_Lon".to_string()]);
    }

    #[test]
    fn test_green_layout() {
        let s = schema(&[
            ("lpep_pickup_datetime", ts()),
            ("lpep_dropoff_datetime", ts()),
            ("ehail_fee", DataType::Float64),
        ]);
        let resolved = resolve(&s).unwrap();
        assert_eq!(resolved.revision, "green_2013");
        assert_eq!(resolved.dropped, vec!["ehail_fee".to_string()]);
    }

    #[test]
    fn test_unknown_layout_is_unresolved() {
        let s = schema(&[("pickup", ts()), ("fare", DataType::Float64)]);
        assert!(resolve(&s).is_none());
    }

    #[test]
    fn test_every_revision_maps_both_timestamps() {
        for revision in SCHEMA_REVISIONS {
            let fields: Vec<CanonicalField> = revision.columns.iter().map(|(_, f)| *f).collect();
            assert!(fields.contains(&F::PickupAt), "{} lacks pickup", revision.name);
            assert!(fields.contains(&F::DropoffAt), "{} lacks dropoff", revision.name);
        }
    }
}
