use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inspection_service::service::DEFAULT_RECENT_WINDOW_DAYS;
use inspection_service::{Config, InspectionService, PgMetadataStore, S3ObjectStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Longest window `recent` accepts, about a century
const MAX_RECENT_WINDOW_DAYS: i64 = 36_500;

/// Operator commands for inspection recordings
#[derive(Debug, Parser)]
#[command(name = "inspection-service", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Show a recording's views, completeness and report link
    Status { location: String, recording: String },
    /// Upload one view image from a file
    Upload {
        location: String,
        recording: String,
        view: String,
        file: PathBuf,
    },
    /// Freeze a recording if all required views are present
    Freeze { location: String, recording: String },
    /// Render the report again for a frozen recording
    RegenerateReport { location: String, recording: String },
    /// List recordings created recently at a location
    Recent {
        location: String,
        #[arg(
            long,
            default_value_t = DEFAULT_RECENT_WINDOW_DAYS,
            value_parser = clap::value_parser!(i64).range(1..=MAX_RECENT_WINDOW_DAYS)
        )]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        command = ?cli.command,
        "Starting inspection service"
    );

    // Initialize components
    let metadata_store = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if let Command::Migrate = cli.command {
        return metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations");
    }

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let service = InspectionService::from_config(&config, metadata_store, object_store)
        .context("Failed to initialize inspection service")?;

    match cli.command {
        Command::Migrate => {}
        Command::Status {
            location,
            recording,
        } => {
            let page = service
                .get_or_render_recording(&location, &recording)
                .await
                .context("Failed to load recording")?;
            print_json(&page)?;
        }
        Command::Upload {
            location,
            recording,
            view,
            file,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let receipt = service
                .record_upload(&location, &recording, &view, bytes)
                .await
                .context("Failed to upload view")?;
            print_json(&receipt)?;
        }
        Command::Freeze {
            location,
            recording,
        } => {
            let outcome = service
                .freeze_recording(&location, &recording)
                .await
                .context("Failed to freeze recording")?;
            print_json(&outcome)?;
        }
        Command::RegenerateReport {
            location,
            recording,
        } => {
            let artifact = service
                .regenerate_report(&location, &recording)
                .await
                .context("Failed to regenerate report")?;
            info!(
                object_key = %artifact.object_key,
                pages = artifact.page_count,
                "Report regenerated"
            );
            println!("{}", artifact.object_key);
        }
        Command::Recent { location, days } => {
            let window = chrono::Duration::try_days(days)
                .with_context(|| format!("Window of {days} days is out of range"))?;
            let recent = service
                .recent_recordings(&location, window)
                .await
                .context("Failed to list recent recordings")?;
            print_json(&recent)?;
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    // Logs go to stderr so command output on stdout stays machine-readable
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
