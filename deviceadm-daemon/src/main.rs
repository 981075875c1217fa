//! deviceadm - device admission service
//!
//! Opens the device store, brings its schema up to date and runs one admission
//! operation. Every admission command migrates first; if migration fails, times
//! out or is interrupted, the command is never executed.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use deviceadm_core::{AuthId, DeviceAttributes, DeviceStatus, SchemaVersion};
use deviceadm_daemon::config::{default_database_path, database_url_for, DEFAULT_MAX_CONNECTIONS};
use deviceadm_daemon::{AdmissionController, Config, DeviceStore, ListFilter, Migrator};
use serde::Serialize;
use tokio::signal;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Definition
// ============================================================================

/// Device admission service
#[derive(Parser)]
#[command(name = "deviceadm", version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    /// Storage endpoint [default: sqlite database in the local data directory]
    #[arg(long, env = "DEVICEADM_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Maximum pooled database connections
    #[arg(long, env = "DEVICEADM_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS, global = true)]
    max_connections: u32,

    /// Abort if schema migration takes longer than this many seconds
    #[arg(long, env = "DEVICEADM_MIGRATION_DEADLINE_SECS", global = true)]
    migration_deadline_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply schema migrations
    Migrate {
        /// Schema version to migrate to (e.g. "1.1.0") [default: latest]
        #[arg(long)]
        target: Option<SchemaVersion>,
    },

    #[command(flatten)]
    Device(DeviceCommand),
}

#[derive(Subcommand)]
enum DeviceCommand {
    /// Submit an admission request on behalf of a device
    Submit {
        /// Device identity data
        #[arg(long)]
        identity: String,

        /// Device authentication public key
        #[arg(long)]
        key: String,

        /// Device attribute as NAME=VALUE (repeatable)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },

    /// List devices, most recent request first
    List {
        /// Only devices with this status (pending, accepted, rejected)
        #[arg(long)]
        status: Option<DeviceStatus>,

        /// Number of devices to skip
        #[arg(long, default_value_t = 0)]
        skip: u32,

        /// Maximum number of devices to print
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a device
    Show { id: String },

    /// Accept a device
    Accept { id: String },

    /// Reject a device
    Reject { id: String },

    /// Delete a device
    Delete { id: String },
}

/// Parse a `NAME=VALUE` attribute.
fn parse_attribute(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", s))?;
    Ok((name.to_string(), value.to_string()))
}

impl ConfigArgs {
    fn into_config(self) -> anyhow::Result<Config> {
        let database_url = match self.database_url {
            Some(url) => url,
            None => {
                let path = default_database_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create data directory {}", parent.display())
                    })?;
                }
                database_url_for(&path)
            }
        };

        let deadline = self.migration_deadline_secs.map(Duration::from_secs);
        Ok(Config::new(database_url, self.max_connections, deadline)?)
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.into_config()?;
    let store = DeviceStore::open(&config)
        .await
        .context("Database connection failed")?;

    let result = run(cli.command, &config, &store).await;
    store.close().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "deviceadm failed");
    }
    result
}

async fn run(command: Commands, config: &Config, store: &DeviceStore) -> anyhow::Result<()> {
    let migrator = Migrator::with_builtin(store.clone())?;

    match command {
        Commands::Migrate { target } => {
            let target = target.unwrap_or_else(|| migrator.latest_version());
            let applied = run_migrations(&migrator, target, config.migration_deadline).await?;
            let applied: Vec<String> = applied.iter().map(ToString::to_string).collect();
            print_json(&serde_json::json!({
                "schema_version": store.schema_version().await?.to_string(),
                "applied": applied,
            }))
        }
        Commands::Device(command) => {
            run_migrations(&migrator, migrator.latest_version(), config.migration_deadline)
                .await?;
            let controller = AdmissionController::new(store.clone());
            run_device_command(command, &controller).await
        }
    }
}

/// Run migrations to `target`, treating a missed deadline or Ctrl+C as fatal.
async fn run_migrations(
    migrator: &Migrator,
    target: SchemaVersion,
    deadline: Option<Duration>,
) -> anyhow::Result<Vec<SchemaVersion>> {
    tokio::select! {
        result = migrate_within(migrator, target, deadline) => {
            result.context("Schema migration failed; refusing to run admission commands")
        }
        _ = signal::ctrl_c() => {
            bail!("Schema migration interrupted; run `deviceadm migrate` to resume")
        }
    }
}

async fn migrate_within(
    migrator: &Migrator,
    target: SchemaVersion,
    deadline: Option<Duration>,
) -> anyhow::Result<Vec<SchemaVersion>> {
    let Some(deadline) = deadline else {
        return Ok(migrator.up(target).await?);
    };

    let applied = tokio::time::timeout(deadline, migrator.up(target))
        .await
        .with_context(|| {
            format!(
                "Schema migration exceeded its deadline of {}s",
                deadline.as_secs()
            )
        })??;
    Ok(applied)
}

async fn run_device_command(
    command: DeviceCommand,
    controller: &AdmissionController,
) -> anyhow::Result<()> {
    match command {
        DeviceCommand::Submit {
            identity,
            key,
            attributes,
        } => {
            let attributes: DeviceAttributes = attributes.into_iter().collect();
            let device = controller.submit(&identity, &key, attributes).await?;
            print_json(&device)
        }
        DeviceCommand::List {
            status,
            skip,
            limit,
        } => {
            let filter = ListFilter {
                status,
                skip,
                limit,
            };
            print_json(&controller.list_devices(&filter).await?)
        }
        DeviceCommand::Show { id } => print_json(&controller.get_device(&AuthId::new(id)).await?),
        DeviceCommand::Accept { id } => {
            let id = AuthId::new(id);
            controller.accept(&id).await?;
            print_json(&controller.get_device(&id).await?)
        }
        DeviceCommand::Reject { id } => {
            let id = AuthId::new(id);
            controller.reject(&id).await?;
            print_json(&controller.get_device(&id).await?)
        }
        DeviceCommand::Delete { id } => {
            let id = AuthId::new(id);
            controller.delete_device(&id).await?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
