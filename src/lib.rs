//! Monthly taxi trip ETL and trip-duration regression training.
//!
//! raw month -> [`transform`] -> processed months -> [`train`] -> model artifact

pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod storage;
pub mod train;
pub mod transform;

pub use config::{ConfigSource, Endpoint, EnvConfig, Fallback, StaticConfig, TerraformState};
pub use error::{PipelineError, Result};
pub use ingest::{download_file, monthly_data_url, IngestJob};
pub use model::{TripDurationModel, MODEL_FILE_NAME};
pub use storage::{FsObjectStore, ObjectMeta, ObjectStore};
pub use train::{
    concat_datasets, load_training_datasets, run_training, split_features_and_target,
    train_test_split, TrainOutcome,
};
pub use transform::{transform, TransformJob, TransformSummary, FINAL_SCHEMA};
