use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use yuru_core::{ArrivalDetail, CorrelationTable, Metric};
use yuru_storage::{fingerprint, PgLake};
use yuru_sync::{
    arrivals, correlate, daily_digest, export_snapshot, open_lake, run_scheduled, write_run_report,
    ArrivalGrid, LakeBackend, SyncConfig, SyncPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "yuru")]
#[command(about = "YuruHealth raw data lake: fetch, dedup, and inspect")]
struct Cli {
    /// Directory holding sources.yaml, fixtures/ and reports/.
    #[arg(long, env = "YURU_WORKSPACE", default_value = ".", global = true)]
    workspace: PathBuf,

    /// Overrides YURU_USER_ID.
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled feed once and write a run report.
    Sync,
    /// Run syncs on the configured cron schedule until ctrl-c.
    Schedule,
    /// Apply the Postgres schema.
    Migrate,
    /// Serve the JSON read API.
    Serve,
    /// Most recent records across all sources.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Records fetched on one canonical date, grouped by source.
    ByDate { date: NaiveDate },
    /// Presence grid over the trailing days.
    Arrivals {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Sleep score joined to indoor sensor daily averages.
    Correlate {
        #[arg(long, default_value_t = 14)]
        days: u32,
    },
    /// Markdown digest of one canonical date.
    Digest { date: NaiveDate },
    /// Parquet snapshot of the lake and the correlation table.
    Export {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, default_value = "exports")]
        out: PathBuf,
    },
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env().with_workspace_root(&cli.workspace);
    if let Some(user) = cli.user {
        config.user_id = user;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_once().await;
            let reports_dir = write_run_report(&config.workspace_root, &summary).await?;
            println!("{}", summary.one_line());
            println!(
                "sync complete: run_id={} inserted={} skipped={} failed_feeds={} reports={}",
                summary.run_id,
                summary.inserted(),
                summary.skipped(),
                summary.failed_feeds(),
                reports_dir.display()
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
            info!(feeds = ?pipeline.producer_labels(), "starting scheduler");
            run_scheduled(&config, pipeline).await?;
        }
        Commands::Migrate => {
            if config.backend != LakeBackend::Postgres {
                bail!("migrate only applies to the postgres backend (YURU_LAKE_BACKEND=postgres)");
            }
            let lake = PgLake::connect(&config.database_url)
                .await
                .context("connecting to postgres lake")?;
            lake.migrate().await.context("migrating raw_data_lake")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let lake = open_lake(&config).await?;
            yuru_web::serve(yuru_web::AppState::new(lake, config.user_id.clone()), config.web_port)
                .await?;
        }
        Commands::Recent { limit } => {
            let lake = open_lake(&config).await?;
            for record in lake.recent_raw(limit).await? {
                let fp = fingerprint(&record.payload);
                println!(
                    "{:>6}  {}  {}/{}  {}  {}",
                    record.id,
                    record.fetched_at.format("%Y-%m-%d %H:%M:%S%:z"),
                    record.source,
                    record.category,
                    record.user_id,
                    &fp[..12]
                );
            }
        }
        Commands::ByDate { date } => {
            let lake = open_lake(&config).await?;
            let grouped = lake.raw_by_date(&config.user_id, date).await?;
            println!("{}", serde_json::to_string_pretty(&grouped)?);
        }
        Commands::Arrivals { days } => {
            let lake = open_lake(&config).await?;
            let grid = arrivals(&lake, &config.user_id, days).await?;
            print!("{}", render_grid(&grid));
        }
        Commands::Correlate { days } => {
            let lake = open_lake(&config).await?;
            let table = correlate(&lake, &config.user_id, days).await?;
            print!("{}", render_correlation(&table));
        }
        Commands::Digest { date } => {
            let lake = open_lake(&config).await?;
            print!("{}", daily_digest(&lake, &config.user_id, date).await?);
        }
        Commands::Export { days, out } => {
            let lake = open_lake(&config).await?;
            let out_dir = if out.is_absolute() {
                out
            } else {
                config.workspace_root.join(out)
            };
            let manifest = export_snapshot(&lake, &config.user_id, days, &out_dir).await?;
            for file in &manifest.files {
                println!("{} rows={} bytes={} sha256={}", file.path, file.rows, file.bytes, file.sha256);
            }
        }
    }

    Ok(())
}

/// One line per source, one glyph per date: `#` badge or series, `o` present
/// without recognizable values, `.` no data.
fn render_grid(grid: &ArrivalGrid) -> String {
    let mut out = String::new();
    if let (Some(first), Some(last)) = (grid.dates.first(), grid.dates.last()) {
        out.push_str(&format!("{:<16}{} .. {}\n", "", first, last));
    }
    for source in &grid.sources {
        let glyphs: String = grid
            .row(*source)
            .iter()
            .map(|cell| match (&cell.detail, cell.has_data) {
                (_, false) => '.',
                (ArrivalDetail::Badge { badge }, true) if badge.is_empty() => 'o',
                (ArrivalDetail::Series { timeseries, .. }, true) if timeseries.is_empty() => 'o',
                _ => '#',
            })
            .collect();
        out.push_str(&format!("{:<16}{}\n", source.display_name(), glyphs));
    }
    out
}

/// Tab-separated table; each average lands under the column that names it.
fn render_correlation(table: &CorrelationTable) -> String {
    let metrics: Vec<Metric> = table
        .columns
        .iter()
        .filter_map(|column| Metric::ALL.into_iter().find(|m| m.avg_column() == *column))
        .collect();
    let mut out = table.columns.join("\t");
    out.push('\n');
    for row in &table.rows {
        let mut cells = vec![row.date.to_string(), row.score.to_string()];
        cells.extend(metrics.iter().map(|metric| {
            row.average(*metric)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".into())
        }));
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}
