use std::path::PathBuf;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trip_duration_predictor::{
    ingest::monthly_file_name, monthly_data_url, run_training, EnvConfig, Fallback,
    FsObjectStore, IngestJob, TerraformState, TransformJob,
};

// Batch entry point, one subcommand per job
// 1. ingest: download a month of raw trips into the raw bucket
// 2. transform: clean the latest raw month into the processed bucket
// 3. train: fit the duration model on processed months and save it

#[derive(Parser)]
#[command(name = "trip-duration-predictor", version, about = "Taxi trip ETL and duration model training")]
struct Cli {
    /// Terraform state file holding the bucket names
    #[arg(long, global = true, env = "TRIP_STATE_FILE", default_value = "terraform/terraform.tfstate")]
    state_file: PathBuf,

    /// Directory backing the object store, one sub-directory per bucket
    #[arg(long, global = true, env = "TRIP_STORE_ROOT", default_value = "./buckets")]
    store_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download one month of yellow taxi trips and upload it to the raw bucket
    Ingest {
        /// Month to fetch, as YYYY-MM
        #[arg(long, default_value = "2024-01", value_parser = parse_month)]
        month: (i32, u32),

        /// Override the download URL
        #[arg(long)]
        url: Option<String>,

        /// Where the downloaded file is kept
        #[arg(long, default_value = ".")]
        download_dir: PathBuf,
    },
    /// Clean the latest raw month and write it to the processed bucket
    Transform,
    /// Train the trip duration model on a directory of processed months
    Train {
        #[arg(long, env = "SM_MODEL_DIR")]
        model_dir: PathBuf,

        #[arg(long = "train", env = "SM_CHANNEL_TRAIN")]
        train_dir: PathBuf,
    },
}

fn parse_month(raw: &str) -> Result<(i32, u32), String> {
    let date = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM: {e}"))?;
    Ok((date.year(), date.month()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    // environment overrides win over the state file
    let config = Fallback::new(EnvConfig, TerraformState::new(&cli.state_file));
    let store = FsObjectStore::new(&cli.store_root);

    match cli.command {
        Command::Ingest {
            month: (year, month),
            url,
            download_dir,
        } => {
            let url = url.unwrap_or_else(|| monthly_data_url(year, month));
            let local_path = download_dir.join(monthly_file_name(year, month));
            let key = IngestJob::new(config, store)
                .run(&url, &local_path)
                .context("ingest failed")?;
            println!("Uploaded {key}");
        }
        Command::Transform => {
            let summary = TransformJob::new(config, store)
                .run()
                .context("transform failed")?;
            println!(
                "Processed {} ({} rows) into {} ({} rows)",
                summary.input_key, summary.input_rows, summary.output_key, summary.output_rows
            );
        }
        Command::Train {
            model_dir,
            train_dir,
        } => {
            let (outcome, path) =
                run_training(&train_dir, &model_dir).context("training failed")?;
            println!("Root Mean Squared Error: {}", outcome.rmse);
            println!("Model saved to {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_argument_is_validated() {
        assert_eq!(parse_month("2024-01"), Ok((2024, 1)));
        assert_eq!(parse_month("2023-12"), Ok((2023, 12)));
        assert!(parse_month("2024-13").is_err());
        assert!(parse_month("january").is_err());
    }

    #[test]
    fn train_reads_sagemaker_style_arguments() {
        let cli = Cli::try_parse_from([
            "trip-duration-predictor",
            "train",
            "--model-dir",
            "/opt/ml/model",
            "--train",
            "/opt/ml/input/data/train",
        ])
        .unwrap();

        match cli.command {
            Command::Train {
                model_dir,
                train_dir,
            } => {
                assert_eq!(model_dir, PathBuf::from("/opt/ml/model"));
                assert_eq!(train_dir, PathBuf::from("/opt/ml/input/data/train"));
            }
            _ => panic!("expected train command"),
        }
    }
}
