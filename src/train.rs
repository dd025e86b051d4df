//! Training of the trip-duration regression on processed datasets.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use linfa::traits::Fit;
use linfa::DatasetBase;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, Axis};
use polars::functions::concat_df_diagonal;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::model::TripDurationModel;
use crate::transform::DURATION_COLUMN;

pub const FEATURES: [&str; 5] = [
    "trip_distance",
    "passenger_count",
    "fare_amount",
    "tip_amount",
    "tolls_amount",
];
pub const TARGET: &str = DURATION_COLUMN;

pub const TEST_FRACTION: f64 = 0.2;
pub const SPLIT_SEED: u64 = 42;

#[derive(Clone, Debug)]
pub struct TrainOutcome {
    pub model: TripDurationModel,
    /// Root mean squared error on the held-out partition.
    pub rmse: f64,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Read every `*.parquet` file in `dir`, in file-name order.
pub fn load_training_datasets(dir: &Path) -> Result<Vec<DataFrame>> {
    let unavailable = |e: std::io::Error| {
        PipelineError::source_unavailable(format!("failed to read {}: {e}", dir.display()))
    };

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(unavailable)? {
        let path = entry.map_err(unavailable)?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "parquet") {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(PipelineError::InsufficientData(format!(
            "no parquet files in {}",
            dir.display()
        )));
    }

    paths
        .iter()
        .map(|path| {
            let file = File::open(path).map_err(|e| {
                PipelineError::source_unavailable(format!("failed to open {}: {e}", path.display()))
            })?;
            let df = ParquetReader::new(file).finish().map_err(|e| {
                PipelineError::source_unavailable(format!("failed to read {}: {e}", path.display()))
            })?;
            info!("Loaded {} rows from {}", df.height(), path.display());
            Ok(df)
        })
        .collect()
}

/// Convert every column to `Float64`. Values that cannot be read as a number
/// (unparseable strings, NaN, infinities) become null.
pub fn coerce_numeric(df: &DataFrame) -> Result<DataFrame> {
    let columns: Vec<Series> = df
        .get_columns()
        .iter()
        .map(|s| Series::new(s.name(), numeric_values(s)))
        .collect();
    Ok(DataFrame::new(columns)?)
}

fn numeric_values(series: &Series) -> Vec<Option<f64>> {
    let missing = || vec![None; series.len()];
    let values: Vec<Option<f64>> = match series.dtype() {
        DataType::String => match series.str() {
            Ok(ca) => ca
                .into_iter()
                .map(|v| v.and_then(|s| s.trim().parse::<f64>().ok()))
                .collect(),
            Err(_) => missing(),
        },
        // temporal columns become their physical integer value
        _ => match series.to_physical_repr().cast(&DataType::Float64) {
            Ok(cast) => match cast.f64() {
                Ok(ca) => ca.into_iter().collect(),
                Err(_) => missing(),
            },
            Err(_) => missing(),
        },
    };

    values
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect()
}

/// Stack the datasets row-wise after numeric coercion. The result has the
/// union of all columns in first-seen order; a dataset lacking a column
/// contributes nulls for it.
pub fn concat_datasets(datasets: &[DataFrame]) -> Result<DataFrame> {
    if datasets.is_empty() {
        return Err(PipelineError::InsufficientData("no datasets to train on".into()));
    }
    let numeric = datasets
        .iter()
        .map(coerce_numeric)
        .collect::<Result<Vec<_>>>()?;

    Ok(concat_df_diagonal(&numeric)?)
}

/// Drop every row with a null in any column.
pub fn drop_incomplete_rows(df: &DataFrame) -> Result<DataFrame> {
    Ok(df.drop_nulls::<String>(None)?)
}

/// Shuffle row indices with a seeded rng; the first `ceil(n * test_fraction)`
/// go to the test partition and the rest to the train partition.
pub fn train_test_split(
    df: &DataFrame,
    test_fraction: f64,
    seed: u64,
) -> Result<(DataFrame, DataFrame)> {
    let n = df.height();
    let mut indices: Vec<IdxSize> = (0..n as IdxSize).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_test = ((n as f64 * test_fraction).ceil() as usize).min(n);
    let (test_indices, train_indices) = indices.split_at(n_test);

    let train_ca = IdxCa::from_vec("train", train_indices.to_vec());
    let test_ca = IdxCa::from_vec("test", test_indices.to_vec());

    let train_df = df.take(&train_ca)?;
    let test_df = df.take(&test_ca)?;

    Ok((train_df, test_df))
}

/// Feature matrix (rows x [`FEATURES`]) and target vector.
pub fn split_features_and_target(df: &DataFrame) -> Result<(Array2<f64>, Array1<f64>)> {
    let mut x = Array2::<f64>::zeros((df.height(), FEATURES.len()));
    for (j, name) in FEATURES.iter().enumerate() {
        for (i, value) in column_values(df, name)?.into_iter().enumerate() {
            x[[i, j]] = value;
        }
    }
    let y = Array1::from(column_values(df, TARGET)?);
    Ok((x, y))
}

fn column_values(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = df
        .column(name)
        .map_err(|_| PipelineError::Schema(format!("required column '{name}' is missing")))?;
    let values = series.f64()?.into_no_null_iter().collect();
    Ok(values)
}

fn check_required_columns(df: &DataFrame) -> Result<()> {
    let missing: Vec<&str> = FEATURES
        .iter()
        .copied()
        .chain(std::iter::once(TARGET))
        .filter(|name| df.get_column_index(name).is_none())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Schema(format!(
            "training data is missing columns: {}",
            missing.join(", ")
        )))
    }
}

/// Relative residual below which a centred feature column counts as a
/// linear combination of the columns before it.
const RANK_TOLERANCE: f64 = 1e-7;

/// Ordinary least squares with intercept.
///
/// Constant features and features that are linear combinations of earlier
/// ones get a zero coefficient; the remaining columns are fitted with linfa.
/// Fitted values are the least-squares optimum either way.
pub fn fit_linear_regression(x: Array2<f64>, y: Array1<f64>) -> Result<TripDurationModel> {
    info!(
        "Fitting linear regression on {} samples with {} features",
        x.nrows(),
        x.ncols()
    );
    if x.nrows() == 0 {
        return Err(PipelineError::InsufficientData("no rows to fit on".into()));
    }

    let kept = independent_columns(&x);
    if kept.len() < x.ncols() {
        let dropped: Vec<&str> = (0..x.ncols())
            .filter(|j| !kept.contains(j))
            .map(|j| FEATURES.get(j).copied().unwrap_or("?"))
            .collect();
        warn!(
            "Features {:?} are constant or collinear, fitting them with zero weight",
            dropped
        );
    }

    let mut coefficients = vec![0.0; x.ncols()];
    let intercept = if kept.is_empty() {
        y.mean().unwrap_or(0.0)
    } else {
        let dataset = DatasetBase::new(x.select(Axis(1), &kept), y);
        let fitted = LinearRegression::new()
            .fit(&dataset)
            .map_err(|e| PipelineError::Fit(e.to_string()))?;
        for (&j, &w) in kept.iter().zip(fitted.params()) {
            coefficients[j] = w;
        }
        fitted.intercept()
    };

    if coefficients.iter().any(|w| !w.is_finite()) || !intercept.is_finite() {
        return Err(PipelineError::Fit("fit produced non-finite parameters".into()));
    }

    Ok(TripDurationModel::new(
        FEATURES.iter().map(|f| f.to_string()).collect(),
        coefficients,
        intercept,
    ))
}

/// Indices of a maximal set of linearly independent centred columns, found
/// by Gram-Schmidt in column order.
fn independent_columns(x: &Array2<f64>) -> Vec<usize> {
    let mut basis: Vec<Array1<f64>> = Vec::new();
    let mut kept = Vec::new();

    for (j, column) in x.columns().into_iter().enumerate() {
        let mean = column.mean().unwrap_or(0.0);
        let mut v = column.mapv(|value| value - mean);
        let scale = column.dot(&column).sqrt();
        let norm = v.dot(&v).sqrt();
        if norm <= RANK_TOLERANCE * scale {
            continue;
        }
        for q in &basis {
            let projection = q.dot(&v);
            v.scaled_add(-projection, q);
        }
        let residual = v.dot(&v).sqrt();
        if residual > RANK_TOLERANCE * norm {
            v /= residual;
            basis.push(v);
            kept.push(j);
        }
    }
    kept
}

pub fn root_mean_squared_error(model: &TripDurationModel, x: &Array2<f64>, y: &Array1<f64>) -> f64 {
    let residuals = model.predict(x) - y;
    residuals.mapv(|r| r * r).mean().unwrap_or(0.0).sqrt()
}

/// Fit the duration model on the concatenation of `datasets` and report the
/// held-out error.
pub fn train(datasets: &[DataFrame]) -> Result<TrainOutcome> {
    // 1-2. Concatenate and coerce to numeric
    let combined = concat_datasets(datasets)?;
    info!(
        "Combined {} datasets into {} rows",
        datasets.len(),
        combined.height()
    );

    // 3. Drop rows with missing values
    let cleaned = drop_incomplete_rows(&combined)?;
    info!("Row count after dropping missing values: {}", cleaned.height());

    // 4. Features and target must be present
    check_required_columns(&cleaned)?;
    if cleaned.height() == 0 {
        return Err(PipelineError::InsufficientData(
            "no rows left after dropping missing values".into(),
        ));
    }

    // 5. Split into train and test sets
    let (train_df, test_df) = train_test_split(&cleaned, TEST_FRACTION, SPLIT_SEED)?;
    if train_df.height() == 0 || test_df.height() == 0 {
        return Err(PipelineError::InsufficientData(format!(
            "{} rows cannot be split into non-empty train and test partitions",
            cleaned.height()
        )));
    }

    let (x_train, y_train) = split_features_and_target(&train_df)?;
    let (x_test, y_test) = split_features_and_target(&test_df)?;

    // 6. Fit on the train partition
    let model = fit_linear_regression(x_train, y_train)?;

    // 7. Evaluate on the test partition
    let rmse = root_mean_squared_error(&model, &x_test, &y_test);

    Ok(TrainOutcome {
        model,
        rmse,
        train_rows: train_df.height(),
        test_rows: test_df.height(),
    })
}

/// Load every processed dataset in `train_dir`, train, and persist the model
/// into `model_dir`. Nothing is written unless training succeeds.
pub fn run_training(train_dir: &Path, model_dir: &Path) -> Result<(TrainOutcome, PathBuf)> {
    let datasets = load_training_datasets(train_dir)?;
    let outcome = train(&datasets)?;
    let path = outcome.model.save(model_dir)?;
    info!("Saved model to {}", path.display());
    Ok((outcome, path))
}
