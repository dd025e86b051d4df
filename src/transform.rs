//! Cleaning and feature engineering for one month of raw trip records.
//!
//! Each stage is a batch operation over the whole dataframe: a polars filter
//! expression or a derived column, applied in one go.

use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;
use tracing::{info, warn};

use crate::config::{ConfigSource, Endpoint};
use crate::error::{PipelineError, Result};
use crate::storage::{read_parquet_bytes, ObjectStore};

pub const PICKUP_COLUMN: &str = "tpep_pickup_datetime";
pub const DROPOFF_COLUMN: &str = "tpep_dropoff_datetime";
pub const DISTANCE_COLUMN: &str = "trip_distance";
pub const FARE_COLUMN: &str = "fare_amount";
pub const DURATION_COLUMN: &str = "trip_duration_minutes";

pub const MIN_TRIP_MINUTES: f64 = 1.0;
pub const MAX_TRIP_MINUTES: f64 = 120.0;

/// Columns kept after transformation, in output order.
pub const FINAL_SCHEMA: [&str; 19] = [
    "VendorID",
    PICKUP_COLUMN,
    DROPOFF_COLUMN,
    "passenger_count",
    DISTANCE_COLUMN,
    "RatecodeID",
    "PULocationID",
    "DOLocationID",
    "payment_type",
    FARE_COLUMN,
    "extra",
    "mta_tax",
    "tip_amount",
    "tolls_amount",
    "improvement_surcharge",
    "total_amount",
    "congestion_surcharge",
    "airport_fee",
    DURATION_COLUMN,
];

const REQUIRED_COLUMNS: [&str; 4] = [DISTANCE_COLUMN, FARE_COLUMN, PICKUP_COLUMN, DROPOFF_COLUMN];

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Run every stage in order: validity filter, duration, outlier filter,
/// projection onto [`FINAL_SCHEMA`].
pub fn transform(df: DataFrame) -> Result<DataFrame> {
    info!("Initial row count: {}", df.height());

    // An empty frame may not carry a schema at all; nothing to filter.
    if df.height() == 0 && REQUIRED_COLUMNS.iter().any(|c| df.get_column_index(c).is_none()) {
        return project_final_schema(&df);
    }

    // 1. Drop rows with invalid distance or fare
    let df = filter_invalid_trips(&df)?;
    info!("Row count after filtering invalid trips: {}", df.height());

    // 2. Derive trip duration in minutes
    let df = add_trip_duration(df)?;

    // 3. Remove duration outliers
    let df = filter_duration_outliers(&df)?;
    info!("Row count after filtering duration outliers: {}", df.height());

    // 4. Keep only the final columns that exist in this month's schema
    project_final_schema(&df)
}

/// Keep rows with `trip_distance > 0` and `fare_amount > 0`. Nulls fail.
pub fn filter_invalid_trips(df: &DataFrame) -> Result<DataFrame> {
    required_column(df, DISTANCE_COLUMN)?;
    required_column(df, FARE_COLUMN)?;

    let positive = |name: &str| col(name).cast(DataType::Float64).gt(lit(0.0));
    let valid = df
        .clone()
        .lazy()
        .filter(positive(DISTANCE_COLUMN).and(positive(FARE_COLUMN)))
        .collect()?;
    Ok(valid)
}

/// Add `trip_duration_minutes = (dropoff - pickup) seconds / 60`.
///
/// String timestamp columns are replaced by their parsed `Datetime` form.
/// Rows whose timestamps cannot be parsed get a null duration.
pub fn add_trip_duration(mut df: DataFrame) -> Result<DataFrame> {
    let pickup = timestamp_micros(required_column(&df, PICKUP_COLUMN)?)?;
    let dropoff = timestamp_micros(required_column(&df, DROPOFF_COLUMN)?)?;

    for (name, values) in [(PICKUP_COLUMN, &pickup), (DROPOFF_COLUMN, &dropoff)] {
        if matches!(df.column(name)?.dtype(), DataType::String) {
            let parsed = Series::new(name, values.clone())
                .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;
            df.with_column(parsed)?;
        }
    }

    let minutes: Vec<Option<f64>> = pickup
        .iter()
        .zip(&dropoff)
        .map(|(p, d)| match (p, d) {
            (Some(p), Some(d)) => d.checked_sub(*p).map(|us| us as f64 / 60_000_000.0),
            _ => None,
        })
        .collect();

    df.with_column(Series::new(DURATION_COLUMN, minutes))?;
    Ok(df)
}

/// Keep rows with a duration within `[1, 120]` minutes.
pub fn filter_duration_outliers(df: &DataFrame) -> Result<DataFrame> {
    required_column(df, DURATION_COLUMN)?;

    let minutes = || col(DURATION_COLUMN).cast(DataType::Float64);
    let in_range = df
        .clone()
        .lazy()
        .filter(
            minutes()
                .gt_eq(lit(MIN_TRIP_MINUTES))
                .and(minutes().lt_eq(lit(MAX_TRIP_MINUTES))),
        )
        .collect()?;
    Ok(in_range)
}

/// Select the [`FINAL_SCHEMA`] columns present in `df`, in schema order.
/// Columns this month's file lacks are skipped rather than rejected.
pub fn project_final_schema(df: &DataFrame) -> Result<DataFrame> {
    let columns: Vec<&str> = FINAL_SCHEMA
        .iter()
        .copied()
        .filter(|name| df.get_column_index(name).is_some())
        .collect();

    Ok(df.select(columns)?)
}

/// Prefix under which processed months are stored in the processed bucket.
pub const PROCESSED_PREFIX: &str = "trips";

/// `some/dir/yellow_tripdata_2024-01.parquet` -> `trips/yellow_tripdata_2024-01.parquet`
pub fn processed_key(raw_key: &str) -> String {
    let base = raw_key.rsplit('/').next().unwrap_or(raw_key);
    format!("{PROCESSED_PREFIX}/{base}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransformSummary {
    pub input_key: String,
    pub output_key: String,
    pub input_rows: usize,
    pub output_rows: usize,
}

/// Moves the latest raw month through [`transform`] into the processed bucket.
pub struct TransformJob<C, S> {
    config: C,
    store: S,
}

impl<C: ConfigSource, S: ObjectStore> TransformJob<C, S> {
    pub fn new(config: C, store: S) -> Self {
        Self { config, store }
    }

    pub fn run(&self) -> Result<TransformSummary> {
        let raw_bucket = self.config.resolve(Endpoint::RawBucket)?;
        let processed_bucket = self.config.resolve(Endpoint::ProcessedBucket)?;

        let (input_key, bytes) = self.store.get_latest(&raw_bucket)?;
        info!("Reading data from: {}/{}", raw_bucket, input_key);
        let raw = read_parquet_bytes(bytes).map_err(|e| {
            PipelineError::source_unavailable(format!(
                "failed to read {raw_bucket}/{input_key}: {e}"
            ))
        })?;
        let input_rows = raw.height();

        let mut processed = transform(raw)?;
        if processed.height() == 0 {
            warn!("No rows survived cleaning of {}", input_key);
        }

        let output_key = processed_key(&input_key);
        info!("Writing processed data to: {}/{}", processed_bucket, output_key);
        self.store
            .write(&mut processed, &processed_bucket, &output_key)?;
        info!("ETL process complete.");

        Ok(TransformSummary {
            input_key,
            output_key,
            input_rows,
            output_rows: processed.height(),
        })
    }
}

fn required_column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Series> {
    df.column(name)
        .map_err(|_| PipelineError::Schema(format!("required column '{name}' is missing")))
}

/// Timestamps as microseconds since the epoch, whatever the stored type.
/// Values outside the `i64` microsecond range become null.
fn timestamp_micros(series: &Series) -> Result<Vec<Option<i64>>> {
    match series.dtype() {
        DataType::Datetime(unit, _) => {
            let unit = *unit;
            let physical = series.to_physical_repr();
            let values = physical
                .i64()?
                .into_iter()
                .map(|v| {
                    v.and_then(|v| match unit {
                        TimeUnit::Nanoseconds => Some(v / 1_000),
                        TimeUnit::Microseconds => Some(v),
                        TimeUnit::Milliseconds => v.checked_mul(1_000),
                    })
                })
                .collect();
            Ok(values)
        }
        DataType::Date => {
            let physical = series.to_physical_repr();
            let values = physical
                .i32()?
                .into_iter()
                .map(|days| days.and_then(|d| i64::from(d).checked_mul(86_400_000_000)))
                .collect();
            Ok(values)
        }
        DataType::String => Ok(series
            .str()?
            .into_iter()
            .map(|v| v.and_then(parse_timestamp))
            .collect()),
        other => Err(PipelineError::Schema(format!(
            "column '{}' has type {other}, expected a timestamp",
            series.name()
        ))),
    }
}

fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_micros());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_micros())
}
