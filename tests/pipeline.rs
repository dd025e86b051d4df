use std::fs::File;
use std::time::{Duration, SystemTime};

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use tempfile::TempDir;

use trip_duration_predictor::{
    run_training, Endpoint, FsObjectStore, ObjectStore, PipelineError, StaticConfig,
    TransformJob, TripDurationModel, FINAL_SCHEMA,
};

const RAW: &str = "raw-trips";
const PROCESSED: &str = "processed-trips";

fn config() -> StaticConfig {
    StaticConfig::new()
        .with(Endpoint::RawBucket, RAW)
        .with(Endpoint::ProcessedBucket, PROCESSED)
}

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// 50 raw trips; rows 3, 13, .. have a zero fare and rows 7, 17, .. last
/// two and a half hours, leaving 40 valid trips.
fn raw_month() -> DataFrame {
    let fmt = "%Y-%m-%d %H:%M:%S";
    let mut vendor = Vec::new();
    let mut pickup = Vec::new();
    let mut dropoff = Vec::new();
    let mut passengers = Vec::new();
    let mut distance = Vec::new();
    let mut fare = Vec::new();
    let mut tip = Vec::new();
    let mut tolls = Vec::new();
    let mut flag = Vec::new();

    for i in 0..50i64 {
        let d = 1.0 + (i % 9) as f64 * 0.7;
        let minutes = if i % 10 == 7 {
            150.0
        } else {
            2.0 + 3.0 * d + (i % 7) as f64
        };
        let begin = start() + chrono::Duration::hours(i);
        let end = begin + chrono::Duration::seconds((minutes * 60.0_f64).round() as i64);

        vendor.push(1 + i % 2);
        pickup.push(begin.format(fmt).to_string());
        dropoff.push(end.format(fmt).to_string());
        passengers.push((1 + i % 4) as f64);
        distance.push(d);
        fare.push(if i % 10 == 3 { 0.0 } else { 5.0 + (i % 13) as f64 * 1.5 });
        tip.push((i % 5) as f64 * 0.8);
        tolls.push(if i % 6 == 0 { 6.94 } else { 0.0 });
        flag.push(if i % 3 == 0 { "Y" } else { "N" });
    }

    df!(
        "VendorID" => vendor,
        "tpep_pickup_datetime" => pickup,
        "tpep_dropoff_datetime" => dropoff,
        "passenger_count" => passengers,
        "trip_distance" => distance,
        "store_and_fwd_flag" => flag,
        "fare_amount" => fare,
        "tip_amount" => tip,
        "tolls_amount" => tolls
    )
    .unwrap()
}

fn put_raw(store: &FsObjectStore, key: &str, mut df: DataFrame, modified: SystemTime) {
    store.write(&mut df, RAW, key).unwrap();
    File::options()
        .write(true)
        .open(store.root().join(RAW).join(key))
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

#[test]
fn transform_then_train_end_to_end() {
    let root = TempDir::new().unwrap();
    let models = TempDir::new().unwrap();
    let store = FsObjectStore::new(root.path());
    let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_710_000_000);

    // older month with nothing usable, newer month with real trips
    put_raw(&store, "yellow_tripdata_2023-12.parquet", raw_month().head(Some(0)), base);
    put_raw(
        &store,
        "yellow_tripdata_2024-01.parquet",
        raw_month(),
        base + Duration::from_secs(3600),
    );

    let summary = TransformJob::new(config(), &store).run().unwrap();
    assert_eq!(summary.input_key, "yellow_tripdata_2024-01.parquet");
    assert_eq!(summary.output_key, "trips/yellow_tripdata_2024-01.parquet");
    assert_eq!(summary.input_rows, 50);
    assert_eq!(summary.output_rows, 40);

    let processed = store.read(PROCESSED, &summary.output_key).unwrap();
    assert_eq!(processed.height(), 40);
    for name in processed.get_column_names() {
        assert!(FINAL_SCHEMA.contains(&name), "unexpected column {name}");
    }
    assert!(processed.get_column_index("store_and_fwd_flag").is_none());

    let minutes = processed
        .column("trip_duration_minutes")
        .unwrap()
        .f64()
        .unwrap();
    let fare = processed.column("fare_amount").unwrap().f64().unwrap();
    let distance = processed.column("trip_distance").unwrap().f64().unwrap();
    for i in 0..processed.height() {
        let m = minutes.get(i).unwrap();
        assert!((1.0..=120.0).contains(&m));
        assert!(fare.get(i).unwrap() > 0.0);
        assert!(distance.get(i).unwrap() > 0.0);
    }

    // the processed bucket's trips/ prefix is the training channel
    let train_dir = root.path().join(PROCESSED).join("trips");
    let (outcome, path) = run_training(&train_dir, models.path()).unwrap();
    assert_eq!(outcome.train_rows, 32);
    assert_eq!(outcome.test_rows, 8);
    assert!(outcome.rmse.is_finite());

    let reloaded = TripDurationModel::load(&path).unwrap();
    assert_eq!(reloaded, outcome.model);
    assert_eq!(reloaded.features.len(), 5);

    // identical input, identical fit
    let again = TempDir::new().unwrap();
    let (second, _) = run_training(&train_dir, again.path()).unwrap();
    assert_eq!(second.model, outcome.model);
}

#[test]
fn fully_filtered_month_is_written_empty() {
    let root = TempDir::new().unwrap();
    let store = FsObjectStore::new(root.path());

    let mut month = raw_month();
    month
        .with_column(Series::new("fare_amount", vec![0.0; 50]))
        .unwrap();
    put_raw(&store, "bad.parquet", month, SystemTime::now());

    let summary = TransformJob::new(config(), &store).run().unwrap();
    assert_eq!(summary.output_rows, 0);

    let processed = store.read(PROCESSED, "trips/bad.parquet").unwrap();
    assert_eq!(processed.height(), 0);
    assert!(processed.get_column_index("trip_duration_minutes").is_some());
}

#[test]
fn empty_raw_bucket_is_source_unavailable() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join(RAW)).unwrap();

    let err = TransformJob::new(config(), FsObjectStore::new(root.path()))
        .run()
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceUnavailable(_)));
    assert!(!root.path().join(PROCESSED).exists());
}

#[test]
fn training_on_unusable_data_writes_no_model() {
    let root = TempDir::new().unwrap();
    let models = TempDir::new().unwrap();

    let mut df = df!(
        "trip_distance" => [1.0, 2.0, 3.0],
        "passenger_count" => [1.0, 1.0, 2.0],
        "fare_amount" => [5.0, 8.0, 11.0],
        "tip_amount" => ["n/a", "n/a", "n/a"],
        "tolls_amount" => [0.0, 0.0, 0.0],
        "trip_duration_minutes" => [4.0, 7.0, 10.0]
    )
    .unwrap();
    let file = File::create(root.path().join("trips.parquet")).unwrap();
    ParquetWriter::new(file).finish(&mut df).unwrap();

    let err = run_training(root.path(), models.path()).unwrap_err();
    assert!(matches!(err, PipelineError::InsufficientData(_)));
    assert!(!models.path().join("model.bin").exists());
}
