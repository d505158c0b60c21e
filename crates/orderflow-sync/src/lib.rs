//! Online-order batch sync: download, extract, stage, transform and upsert, plus the
//! run-level concerns around them (retry, schedule, reports).

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use orderflow_adapters::extract_file;
use orderflow_core::{CleanedRecord, EtlError, EtlResult, PipelineStage, RecordSet};
use orderflow_storage::{
    ArtifactStore, DatasetDownloader, DownloadedDataset, HttpClientConfig, HttpFetcher,
    KaggleCredentials,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod cleaner;
pub mod config;
pub mod report;
pub mod stager;
pub mod store;
pub mod upserter;

pub use cleaner::{transform_records, TransformOutput, TransformStats};
pub use config::{RetryPolicy, SyncConfig};
pub use report::{report_recent_runs, write_reports, ReportPaths};
pub use stager::{stage_records, StageOutcome};
pub use store::{
    DestinationStore, MemoryStores, PgDestinationStore, MySqlStagingStore, SqlStores, StagingStore,
    StoreProvider,
};
pub use upserter::{upsert_records, UpsertReport};

pub const CRATE_NAME: &str = "orderflow-sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub incoming: usize,
    pub already_staged: usize,
    pub appended: u64,
}

impl From<&StageOutcome> for StageCounts {
    fn from(outcome: &StageOutcome) -> Self {
        Self {
            incoming: outcome.incoming,
            already_staged: outcome.already_staged,
            appended: outcome.appended,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub dry_run: bool,
    pub extracted_rows: usize,
    pub staged: StageCounts,
    pub transform: TransformStats,
    pub upsert: UpsertReport,
    pub reports_dir: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    stores: Arc<dyn StoreProvider>,
    downloader: DatasetDownloader,
    dry_run: bool,
}

impl SyncPipeline {
    /// MySQL staging and PostgreSQL destination, as configured.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let stores = SqlStores::from_config(&config);
        Self::with_stores(config, Arc::new(stores))
    }

    /// Same pipeline against process-local stores; nothing is written to a database.
    pub fn dry_run(config: SyncConfig) -> Result<Self> {
        let mut pipeline = Self::with_stores(config, Arc::new(MemoryStores::new()))?;
        pipeline.dry_run = true;
        Ok(pipeline)
    }

    pub fn with_stores(config: SyncConfig, stores: Arc<dyn StoreProvider>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let downloader = DatasetDownloader::new(
            ArtifactStore::new(config.artifacts_dir.clone()),
            http,
            config.download_dir.clone(),
            KaggleCredentials::from_env(),
        );
        Ok(Self {
            config,
            stores,
            downloader,
            dry_run: false,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn download(&self, run_id: Uuid) -> Result<DownloadedDataset> {
        let span = info_span!("stage", stage = %PipelineStage::Download, %run_id);
        async {
            let result = self.downloader.download(run_id, &self.config.dataset).await;
            if let Err(err) = &result {
                error!(error = %format!("{err:#}"), "download failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    pub fn extract(&self, run_id: Uuid, path: &Path) -> EtlResult<RecordSet> {
        let _guard = info_span!("stage", stage = %PipelineStage::Extract, %run_id).entered();
        extract_file(path).inspect_err(log_stage_error)
    }

    /// Holds one staging connection for the duration of the call.
    pub async fn stage(&self, run_id: Uuid, records: RecordSet) -> EtlResult<StageOutcome> {
        let span = info_span!("stage", stage = %PipelineStage::Stage, %run_id);
        async {
            let mut store = self.stores.staging().await?;
            let outcome = stage_records(records, store.as_mut()).await?;
            Ok::<_, EtlError>(outcome)
        }
        .instrument(span)
        .await
        .inspect_err(log_stage_error)
    }

    pub fn transform(&self, run_id: Uuid, batch: RecordSet) -> EtlResult<TransformOutput> {
        let _guard = info_span!("stage", stage = %PipelineStage::Transform, %run_id).entered();
        transform_records(batch).inspect_err(log_stage_error)
    }

    /// Holds one destination connection for the duration of the call.
    pub async fn upsert(&self, run_id: Uuid, records: &[CleanedRecord]) -> EtlResult<UpsertReport> {
        let span = info_span!("stage", stage = %PipelineStage::Upsert, %run_id);
        async {
            let mut store = self.stores.destination().await?;
            let report = upsert_records(records, store.as_mut()).await?;
            Ok::<_, EtlError>(report)
        }
        .instrument(span)
        .await
        .inspect_err(log_stage_error)
    }

    /// One full batch: download the configured dataset, then every later stage.
    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run(None, RetryPolicy::none()).await
    }

    /// A full batch over a file already on disk; the download stage is skipped.
    pub async fn run_file(&self, path: &Path) -> Result<RunSummary> {
        self.run(Some(path), RetryPolicy::none()).await
    }

    /// Like `run_once`/`run_file`, but a failed stage is re-attempted `retry.retries` times,
    /// `retry.delay` apart, with the same input it was first given. Stages that already
    /// succeeded are not repeated.
    pub async fn run_with_retry(&self, file: Option<&Path>) -> Result<RunSummary> {
        self.run(file, self.config.retry).await
    }

    async fn run(&self, file: Option<&Path>, policy: RetryPolicy) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let (source, path) = match file {
            Some(path) => (path.display().to_string(), path.to_path_buf()),
            None => {
                let downloaded = self
                    .attempt(PipelineStage::Download, policy, move || self.download(run_id))
                    .await?;
                (downloaded.source, downloaded.tabular_path)
            }
        };
        info!(%run_id, %source, dry_run = self.dry_run, "sync run started");

        let path = path.as_path();
        let extracted = self
            .attempt(PipelineStage::Extract, policy, move || async move {
                self.extract(run_id, path)
            })
            .await?;
        let extracted_rows = extracted.len();

        let input = &extracted;
        let staged = self
            .attempt(PipelineStage::Stage, policy, move || {
                self.stage(run_id, input.clone())
            })
            .await?;
        drop(extracted);
        let staged_counts = StageCounts::from(&staged);

        let batch = &staged.batch;
        let transformed = self
            .attempt(PipelineStage::Transform, policy, move || async move {
                self.transform(run_id, batch.clone())
            })
            .await?;

        let records = transformed.records.as_slice();
        let upsert = self
            .attempt(PipelineStage::Upsert, policy, move || self.upsert(run_id, records))
            .await?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source,
            dry_run: self.dry_run,
            extracted_rows,
            staged: staged_counts,
            transform: transformed.stats,
            upsert,
            reports_dir: None,
        };

        // The batch is already committed; a report failure must not fail the run.
        match write_reports(&self.config.reports_root(), &summary, &transformed.records).await {
            Ok(paths) => summary.reports_dir = Some(paths.reports_dir.display().to_string()),
            Err(err) => warn!(%run_id, error = %format!("{err:#}"), "writing run reports failed"),
        }

        info!(
            %run_id,
            extracted = summary.extracted_rows,
            staged = summary.staged.appended,
            cleaned = summary.transform.output_rows,
            inserted = summary.upsert.inserted,
            skipped = summary.upsert.skipped,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Runs one stage until it succeeds or `policy.retries` re-attempts are used up.
    async fn attempt<T, E, F, Fut>(
        &self,
        stage: PipelineStage,
        policy: RetryPolicy,
        mut run: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err: anyhow::Error = match run().await {
                Ok(value) => return Ok(value),
                Err(err) => err.into(),
            };
            if attempt > policy.retries {
                return Err(err.context(format!("{stage} failed after {attempt} attempt(s)")));
            }
            warn!(
                %stage,
                attempt,
                retries = policy.retries,
                delay_ms = policy.delay.as_millis() as u64,
                error = %format!("{err:#}"),
                "stage failed; retrying"
            );
            tokio::time::sleep(policy.delay).await;
        }
    }
}

fn log_stage_error(err: &EtlError) {
    error!(kind = err.kind(), error = %err, "stage failed");
}

/// `None` when the scheduler is disabled in config.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_with_retry(None).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
