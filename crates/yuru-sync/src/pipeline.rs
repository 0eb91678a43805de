//! Fetch Orchestrator: runs every producer in turn and feeds its harvest
//! through the ingestion gate. A failing feed never stops the ones after it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use yuru_adapters::{EnvCredentials, ProducerContext, SourceProducer};
use yuru_core::Source;
use yuru_storage::{HttpFetcher, IngestOutcome, RawDataLake};

use crate::{open_lake, SourceRegistry, SyncConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Completed,
    /// Producer had no credential or input this cycle.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRunReport {
    pub label: String,
    pub source: Source,
    pub category: String,
    pub status: FeedStatus,
    pub harvested: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceRunReport {
    fn new(producer: &dyn SourceProducer, status: FeedStatus) -> Self {
        Self {
            label: producer.label(),
            source: producer.source(),
            category: producer.category().to_string(),
            status,
            harvested: 0,
            inserted: 0,
            skipped: 0,
            failed: 0,
            error: None,
        }
    }

    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted(_) => self.inserted += 1,
            IngestOutcome::Skipped => self.skipped += 1,
            IngestOutcome::Failed(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub user_id: String,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<SourceRunReport>,
}

impl SyncRunSummary {
    pub fn inserted(&self) -> usize {
        self.feeds.iter().map(|f| f.inserted).sum()
    }

    pub fn skipped(&self) -> usize {
        self.feeds.iter().map(|f| f.skipped).sum()
    }

    pub fn failed_feeds(&self) -> usize {
        self.feeds
            .iter()
            .filter(|f| f.status == FeedStatus::Failed)
            .count()
    }

    /// `fetch done | sleep-ring/sleep:3 | scale/measure:-- | weather/current:ERR`
    pub fn one_line(&self) -> String {
        let mut parts = vec!["fetch done".to_string()];
        for feed in &self.feeds {
            let cell = match feed.status {
                FeedStatus::Completed => feed.inserted.to_string(),
                FeedStatus::Skipped => "--".to_string(),
                FeedStatus::Failed => "ERR".to_string(),
            };
            parts.push(format!("{}:{}", feed.label, cell));
        }
        parts.join(" | ")
    }
}

pub struct SyncPipeline {
    lake: RawDataLake,
    producers: Vec<Box<dyn SourceProducer>>,
    user_id: String,
    lookback_days: u32,
    reports_root: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(lake: RawDataLake, producers: Vec<Box<dyn SourceProducer>>, user_id: impl Into<String>) -> Self {
        Self {
            lake,
            producers,
            user_id: user_id.into(),
            lookback_days: 7,
            reports_root: None,
        }
    }

    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    /// Scheduled runs write their report under `<root>/reports/<run_id>/`.
    pub fn with_reports_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.reports_root = Some(root.into());
        self
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let lake = open_lake(config).await?;
        let registry = SourceRegistry::load(&config.registry_path())?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let producers =
            registry.build_producers(&config.workspace_root, http, Arc::new(EnvCredentials))?;
        Ok(Self::new(lake, producers, config.user_id.clone())
            .with_lookback_days(config.lookback_days)
            .with_reports_root(config.workspace_root.clone()))
    }

    pub fn lake(&self) -> &RawDataLake {
        &self.lake
    }

    pub fn producer_labels(&self) -> Vec<String> {
        self.producers.iter().map(|p| p.label()).collect()
    }

    pub async fn run_once(&self) -> SyncRunSummary {
        let started_at = self.lake.now();
        let ctx = ProducerContext::new(self.user_id.clone(), self.lake.tz(), started_at)
            .with_lookback_days(self.lookback_days);
        let run_id = ctx.run_id;

        let mut feeds = Vec::with_capacity(self.producers.len());
        for producer in &self.producers {
            let span = info_span!("feed", %run_id, label = %producer.label());
            let report = self.run_feed(producer.as_ref(), &ctx).instrument(span).await;
            feeds.push(report);
        }

        let summary = SyncRunSummary {
            run_id,
            user_id: self.user_id.clone(),
            backend: self.lake.backend_name().to_string(),
            started_at,
            finished_at: self.lake.now(),
            feeds,
        };
        info!(%run_id, "{}", summary.one_line());
        summary
    }

    async fn run_feed(&self, producer: &dyn SourceProducer, ctx: &ProducerContext) -> SourceRunReport {
        if !producer.is_available() {
            info!("producer unavailable, skipping this cycle");
            return SourceRunReport::new(producer, FeedStatus::Skipped);
        }

        let harvests = match producer.produce(ctx).await {
            Ok(harvests) => harvests,
            Err(err) if err.is_unavailable() => {
                info!(reason = %err, "producer unavailable, skipping this cycle");
                let mut report = SourceRunReport::new(producer, FeedStatus::Skipped);
                report.error = Some(err.to_string());
                return report;
            }
            Err(err) => {
                warn!(error = %err, "producer failed");
                let mut report = SourceRunReport::new(producer, FeedStatus::Failed);
                report.error = Some(err.to_string());
                return report;
            }
        };

        let mut report = SourceRunReport::new(producer, FeedStatus::Completed);
        report.harvested = harvests.len();
        for harvest in harvests {
            let outcome = self.lake.ingest_harvest(harvest).await;
            report.record(&outcome);
        }
        if report.failed > 0 {
            warn!(failed = report.failed, "some records were not stored this cycle");
        }
        report
    }

    /// Runs once and, when a reports root is set, writes the run report.
    pub async fn run_and_report(&self) -> SyncRunSummary {
        let summary = self.run_once().await;
        if let Some(root) = &self.reports_root {
            if let Err(err) = write_run_report(root, &summary).await {
                warn!(error = %err, "failed to write run report");
            }
        }
        summary
    }
}

/// Writes `reports/<run_id>/sync_summary.json` and `sync_brief.md`.
pub async fn write_run_report(workspace_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;

    let mut brief = format!(
        "# YuruHealth Sync\n\n- Run ID: `{}`\n- User: {}\n- Backend: {}\n- Started: {}\n- Finished: {}\n- Inserted: {}\n- Skipped: {}\n\n## Feeds\n",
        summary.run_id,
        summary.user_id,
        summary.backend,
        summary.started_at,
        summary.finished_at,
        summary.inserted(),
        summary.skipped(),
    );
    for feed in &summary.feeds {
        brief.push_str(&format!(
            "- {}: {:?} (harvested {}, inserted {}, skipped {}, failed {})\n",
            feed.label, feed.status, feed.harvested, feed.inserted, feed.skipped, feed.failed
        ));
    }
    fs::write(reports_dir.join("sync_brief.md"), brief)
        .await
        .context("writing sync_brief.md")?;

    Ok(reports_dir)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let summary = pipeline.run_and_report().await;
                info!(run_id = %summary.run_id, inserted = summary.inserted(), "scheduled sync finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Runs the scheduler until ctrl-c. Errors when the scheduler is disabled.
pub async fn run_scheduled(config: &SyncConfig, pipeline: Arc<SyncPipeline>) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(config, pipeline).await? else {
        anyhow::bail!("scheduler is disabled; set YURU_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!(
        cron_1 = %config.sync_cron_1,
        cron_2 = %config.sync_cron_2,
        "scheduler running, ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
