use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use reconciler::statement::validate_identifier;
use reconciler::{
    BisectOptions, DataEndpoint, DataEndpointExt, ReconciliationPair, SqlEndpoint, TimeRange,
    Value,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "eltsync")]
#[command(about = "eltsync - reconcile ELT targets with their sources")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: EltSyncCommands,
}

#[derive(Subcommand)]
enum EltSyncCommands {
    /// Count rows of a table on one database
    Count {
        /// Database key from the configuration
        #[arg(long)]
        database: String,
        #[arg(long)]
        table: String,
        /// Count non-NULL values of this column instead of rows
        #[arg(long)]
        key_column: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Print target count minus source count for a pair
    CompareCounts {
        #[command(flatten)]
        scope: PairTable,
        #[arg(long)]
        key_column: Option<String>,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// List keys present in the target but gone from the source
    FindOrphans {
        #[command(flatten)]
        scope: PairTable,
        #[arg(long)]
        key_column: String,
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Delete orphaned rows from the target
    RemoveOrphans {
        #[command(flatten)]
        scope: PairTable,
        #[arg(long)]
        key_column: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Bisect the time range instead of diffing it in one go
        #[arg(long)]
        binary_search: bool,
        /// Override the configured bisection threshold
        #[arg(long, requires = "binary_search")]
        threshold: Option<u64>,
        /// Override the configured minimum segment size, e.g. "1h" or "30s"
        #[arg(long, requires = "binary_search", value_parser = humantime::parse_duration)]
        min_segment_size: Option<Duration>,
    },
    /// List keys occurring more than once in a table
    Duplicates {
        /// Database key from the configuration
        #[arg(long)]
        database: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        key_column: String,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

#[derive(Args)]
struct PairTable {
    /// Pair name from the configuration
    #[arg(long)]
    pair: String,
    #[arg(long)]
    table: String,
}

#[derive(Args)]
struct RangeArgs {
    /// Inclusive lower bound, e.g. "2024-01-01" or "2024-01-01 12:00:00"
    #[arg(long, value_parser = parse_timestamp)]
    start: Option<NaiveDateTime>,
    /// Exclusive upper bound
    #[arg(long, value_parser = parse_timestamp)]
    end: Option<NaiveDateTime>,
    /// Column the bounds apply to; repeat for several columns
    #[arg(long = "timestamp-column")]
    timestamp_columns: Vec<String>,
    /// Compare dates only, ignoring the time of day
    #[arg(long)]
    stick_to_dates: bool,
}

impl RangeArgs {
    fn to_range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
            timestamp_columns: self.timestamp_columns.clone(),
            stick_to_dates: self.stick_to_dates,
        }
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    Value::from(s)
        .as_timestamp()
        .ok_or_else(|| format!("`{s}` is not a date or timestamp"))
}

async fn connect_pair(name: &str, config: &Configuration) -> Result<ReconciliationPair> {
    ReconciliationPair::from_config(name, config)
        .await
        .with_context(|| format!("Failed to connect pair `{name}`"))
}

async fn connect_database(key: &str, config: &Configuration) -> Result<SqlEndpoint> {
    SqlEndpoint::from_settings(key, config)
        .await
        .with_context(|| format!("Failed to connect database `{key}`"))
}

impl EltSyncCommands {
    async fn run(self, config: &Configuration) -> Result<()> {
        match self {
            EltSyncCommands::Count {
                database,
                table,
                key_column,
                range,
            } => {
                validate_identifier(&table)?;
                if let Some(key_column) = &key_column {
                    validate_identifier(key_column)?;
                }
                let predicate = range.to_range().predicate()?;
                let endpoint = connect_database(&database, config).await?;
                let count = endpoint
                    .count(&table, key_column.as_deref(), &predicate)
                    .await
                    .with_context(|| format!("Failed to count `{table}` on `{database}`"))?;
                println!("{count}");
            }
            EltSyncCommands::CompareCounts {
                scope,
                key_column,
                range,
            } => {
                let pair = connect_pair(&scope.pair, config).await?;
                let delta = pair
                    .compare_counts(&scope.table, key_column.as_deref(), &range.to_range())
                    .await?;
                println!("{delta}");
            }
            EltSyncCommands::FindOrphans {
                scope,
                key_column,
                range,
            } => {
                let pair = connect_pair(&scope.pair, config).await?;
                let orphans = pair
                    .find_orphans(&scope.table, &key_column, &range.to_range())
                    .await?;
                for key in &orphans {
                    println!("{key}");
                }
                log::info!(
                    "{} orphans in `{}` of pair `{}`",
                    orphans.len(),
                    scope.table,
                    pair.name()
                );
            }
            EltSyncCommands::RemoveOrphans {
                scope,
                key_column,
                range,
                binary_search,
                threshold,
                min_segment_size,
            } => {
                let pair = connect_pair(&scope.pair, config).await?;
                let range = range.to_range();
                let removed = if binary_search {
                    let mut options = BisectOptions::from(&config.reconcile);
                    if let Some(threshold) = threshold {
                        options.threshold = threshold;
                    }
                    if let Some(min_segment_size) = min_segment_size {
                        options.min_segment_size = min_segment_size;
                    }
                    pair.remove_orphans_from_target_with_binary_search(
                        &scope.table,
                        &key_column,
                        &range,
                        &options,
                    )
                    .await?
                } else {
                    pair.remove_orphans_from_target(&scope.table, &key_column, &range)
                        .await?
                };
                println!(
                    "Removed {removed} orphans from `{}` of pair `{}`",
                    scope.table,
                    pair.name()
                );
            }
            EltSyncCommands::Duplicates {
                database,
                table,
                key_column,
            } => {
                let endpoint = connect_database(&database, config).await?;
                let duplicates = endpoint.find_duplicate_keys(&table, &key_column).await?;
                for (key, count) in &duplicates {
                    println!("{key}\t{count}");
                }
                log::info!("{} duplicated keys in `{table}`", duplicates.len());
            }
            EltSyncCommands::Common(command) => utils::handle_common_command(&command, config)?,
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    // Load application configuration
    let config = utils::load_config(cli.common.config.as_ref())?;

    cli.command.run(&config).await
}
