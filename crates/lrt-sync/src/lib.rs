//! Sync pipeline orchestration: capture a snapshot per source, reconcile it
//! into the source's store, then write reports.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use lrt_adapters::{
    bundle_from_pages, load_snapshot_bundle, AdapterContext, SelectorAdapter, SnapshotBundle,
    SourceAdapter,
};
use lrt_core::aggregate::{count_active_by, count_by_period};
use lrt_core::{
    EntityKind, KeyDeriver, LifecyclePolicy, RawRecord, ReconcileOptions, ReconcileSummary,
    Reconciler, Reconciliation,
};
use lrt_storage::{load_records, save_records, HttpClientConfig, HttpFetcher, SnapshotArchive};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod reports;
pub mod review;

pub use config::{AggregateConfig, SourceConfig, SourceMode, SourceRegistry, SyncConfig};
use reports::{ChangeLog, MalformedEntry, ReviewFile};
use review::{IdentityReview, ReviewConfig};

pub const CRATE_NAME: &str = "lrt-sync";

/// A snapshot with no keyable record would deactivate every active record;
/// refused unless allowed. Rows that all fail key derivation count as empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source {source_id}: snapshot is empty ({rows} rows, none with a usable key), refusing to deactivate the whole store")]
pub struct EmptySnapshotError {
    pub source_id: String,
    pub rows: usize,
}

/// Returns the number of keyable records.
pub fn guard_snapshot(
    source_id: &str,
    keys: &KeyDeriver,
    records: &[RawRecord],
    allow_empty: bool,
) -> Result<usize, EmptySnapshotError> {
    let keyable = records
        .iter()
        .filter(|record| keys.derive_key(record).is_ok())
        .count();
    if keyable == 0 && !allow_empty {
        return Err(EmptySnapshotError {
            source_id: source_id.to_string(),
            rows: records.len(),
        });
    }
    Ok(keyable)
}

/// One store, one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StoreReconcile<'a> {
    pub source_id: &'a str,
    pub store_path: &'a Path,
    pub kind: EntityKind,
    pub options: &'a ReconcileOptions,
    pub today: NaiveDate,
    pub allow_empty_snapshot: bool,
}

/// Guard the snapshot, load the store and reconcile. The store is written
/// back only when `persist`; a refused snapshot never reaches the store.
pub fn reconcile_store(
    request: &StoreReconcile<'_>,
    snapshot: Vec<RawRecord>,
    persist: bool,
) -> Result<Reconciliation> {
    let StoreReconcile {
        source_id,
        store_path,
        kind,
        options,
        today,
        allow_empty_snapshot,
    } = *request;
    let policy = LifecyclePolicy::resolve(kind, options, today)?;
    guard_snapshot(source_id, &policy.key_deriver(), &snapshot, allow_empty_snapshot)?;

    let existing = load_records(store_path, kind)
        .with_context(|| format!("loading store {}", store_path.display()))?;
    let existing_len = existing.len();
    let snapshot_len = snapshot.len();

    let reconciliation = Reconciler::new(policy).reconcile(existing, snapshot);
    for err in &reconciliation.malformed {
        warn!(kind = %kind, field = %err.field, "malformed record: {err}");
    }
    info!(
        existing = existing_len,
        snapshot = snapshot_len,
        merged = reconciliation.merged.len(),
        created = reconciliation.summary.created,
        updated = reconciliation.summary.updated,
        deactivated = reconciliation.summary.deactivated,
        reactivated = reconciliation.summary.reactivated,
        "reconciled store"
    );

    if persist {
        save_records(store_path, kind, &reconciliation.merged)?;
    }
    Ok(reconciliation)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub kind: EntityKind,
    pub status: SourceStatus,
    pub reason: Option<String>,
    pub snapshot_records: usize,
    pub store_path: String,
    pub summary: Option<ReconcileSummary>,
    pub archived: Vec<String>,
    pub review_candidates: usize,
}

impl SourceOutcome {
    fn failed(source: &SourceConfig, store_path: &Path, err: &anyhow::Error) -> Self {
        Self {
            source_id: source.source_id.clone(),
            kind: source.kind,
            status: SourceStatus::Failed,
            reason: Some(format!("{err:#}")),
            snapshot_records: 0,
            store_path: store_path.display().to_string(),
            summary: None,
            archived: Vec::new(),
            review_candidates: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub sources: Vec<SourceOutcome>,
    pub reports_dir: String,
    pub manifest: String,
}

impl SyncRunSummary {
    pub fn failed_sources(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
            .count()
    }
}

struct CapturedSnapshot {
    bundle: SnapshotBundle,
    archived: Vec<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    archive: SnapshotArchive,
    http: HttpFetcher,
    review: IdentityReview,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let archive = SnapshotArchive::new(config.archive_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            archive,
            http,
            review: IdentityReview::new(ReviewConfig::default()),
        })
    }

    pub fn with_review(mut self, config: ReviewConfig) -> Self {
        self.review = IdentityReview::new(config);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let run_date = self
            .config
            .run_date
            .unwrap_or_else(|| Local::now().date_naive());
        let registry = SourceRegistry::load(&self.config.sources_path).await?;
        let enabled_sources: Vec<_> = registry.enabled().cloned().collect();

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        info!(%run_id, %run_date, sources = enabled_sources.len(), "sync run started");

        let mut report_files = Vec::new();
        let mut outcomes = Vec::new();
        for source in &enabled_sources {
            let store_path = source.store_path(&self.config.data_dir);
            let span = info_span!("sync_source", %run_id, source_id = %source.source_id, kind = %source.kind);
            let outcome = match self
                .sync_source(run_id, run_date, registry.root(), source, &reports_dir, &mut report_files)
                .instrument(span)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %format!("{err:#}"), "source aborted");
                    SourceOutcome::failed(source, &store_path, &err)
                }
            };
            outcomes.push(outcome);
        }

        let finished_at = Utc::now();
        let summary_path = reports_dir.join("run_summary.json");
        let mut summary = SyncRunSummary {
            run_id,
            run_date,
            started_at,
            finished_at,
            enabled_sources: enabled_sources.len(),
            sources: outcomes,
            reports_dir: reports_dir.display().to_string(),
            manifest: reports_dir.join("manifest.json").display().to_string(),
        };
        reports::write_json(&summary_path, &summary)?;
        report_files.push(summary_path);
        let manifest_path = reports::write_manifest(&reports_dir, &report_files)?;
        summary.manifest = manifest_path.display().to_string();

        info!(%run_id, failed = summary.failed_sources(), "sync run finished");
        Ok(summary)
    }

    async fn sync_source(
        &self,
        run_id: Uuid,
        run_date: NaiveDate,
        registry_root: &Path,
        source: &SourceConfig,
        reports_dir: &Path,
        report_files: &mut Vec<PathBuf>,
    ) -> Result<SourceOutcome> {
        let fetched_at = Utc::now();
        let captured = self
            .capture_snapshot(run_id, fetched_at, registry_root, source)
            .await?;
        let snapshot_records = captured.bundle.records.len();
        info!(records = snapshot_records, "snapshot captured");

        let store_path = source.store_path(&self.config.data_dir);
        let options = source.reconcile_options(run_date);
        let reconciliation = reconcile_store(
            &StoreReconcile {
                source_id: &source.source_id,
                store_path: &store_path,
                kind: source.kind,
                options: &options,
                today: run_date,
                allow_empty_snapshot: self.config.allow_empty_snapshot || source.allow_empty_snapshot,
            },
            captured.bundle.records,
            false,
        )?;

        let key_fields = source
            .key_fields
            .clone()
            .unwrap_or_else(|| source.kind.schema().key_fields.iter().map(|f| f.to_string()).collect());
        let candidates = self.review.candidates(&key_fields, &reconciliation.changes);
        if !candidates.is_empty() {
            warn!(candidates = candidates.len(), "possible identity splits need review");
        }

        // Reports first: a failed report leaves the store as it was.
        let written = self.write_source_reports(source, run_date, reports_dir, &reconciliation, &candidates)?;
        save_records(&store_path, source.kind, &reconciliation.merged)
            .with_context(|| format!("saving store {}", store_path.display()))?;
        report_files.extend(written);

        Ok(SourceOutcome {
            source_id: source.source_id.clone(),
            kind: source.kind,
            status: SourceStatus::Completed,
            reason: None,
            snapshot_records,
            store_path: store_path.display().to_string(),
            summary: Some(reconciliation.summary),
            archived: captured.archived,
            review_candidates: candidates.len(),
        })
    }

    async fn capture_snapshot(
        &self,
        run_id: Uuid,
        fetched_at: DateTime<Utc>,
        registry_root: &Path,
        source: &SourceConfig,
    ) -> Result<CapturedSnapshot> {
        let mut archived = Vec::new();
        let bundle = match source.mode {
            SourceMode::Bundle => {
                let path = source.bundle_path(registry_root);
                let bundle = load_snapshot_bundle(&path)?;
                if bundle.source_id != source.source_id || bundle.kind != source.kind {
                    bail!(
                        "bundle {} is for {} ({}), not {} ({})",
                        path.display(),
                        bundle.source_id,
                        bundle.kind,
                        source.source_id,
                        source.kind
                    );
                }
                bundle
            }
            SourceMode::Live => {
                let rules = source
                    .extract
                    .clone()
                    .with_context(|| format!("live source {} has no extract rules", source.source_id))?;
                let adapter = SelectorAdapter::new(
                    source.source_id.clone(),
                    source.kind,
                    source.listing_urls.clone(),
                    rules,
                )?;
                let ctx = AdapterContext { run_id, fetched_at };
                let mut pages = adapter.fetch(&self.http, &ctx).await?;
                let mut bundle = bundle_from_pages(&adapter, &pages, fetched_at)?;

                let store_exists = source.store_path(&self.config.data_dir).exists();
                if adapter.rules().detail.is_some()
                    && source.wants_details(self.config.fetch_details, store_exists)
                {
                    let details = adapter.enrich_details(&self.http, &ctx, &mut bundle.records).await?;
                    info!(source_id = %source.source_id, pages = details.len(), "fetched detail pages");
                    pages.extend(details);
                }
                for page in &pages {
                    let stored = self
                        .archive
                        .store_bytes(fetched_at, adapter.source_id(), extension_for(&page.content_type), &page.body)
                        .await?;
                    archived.push(stored.relative_path.display().to_string());
                }
                bundle
            }
        };

        let raw = serde_json::to_vec_pretty(&bundle).context("serializing snapshot bundle")?;
        let stored = self
            .archive
            .store_bytes(fetched_at, &source.source_id, "json", &raw)
            .await?;
        archived.push(stored.relative_path.display().to_string());
        Ok(CapturedSnapshot { bundle, archived })
    }

    fn write_source_reports(
        &self,
        source: &SourceConfig,
        run_date: NaiveDate,
        reports_dir: &Path,
        reconciliation: &Reconciliation,
        candidates: &[review::SplitCandidate],
    ) -> Result<Vec<PathBuf>> {
        let id = &source.source_id;
        let mut written = Vec::new();

        let changes_path = reports_dir.join(format!("{id}.changes.json"));
        reports::write_json(
            &changes_path,
            &ChangeLog {
                source_id: id,
                kind: source.kind,
                run_date,
                summary: reconciliation.summary,
                changes: &reconciliation.changes,
                malformed: reconciliation.malformed.iter().map(MalformedEntry::from).collect(),
            },
        )?;
        written.push(changes_path);

        let category = source.aggregate.category_field(source.kind);
        let by_category = reports_dir.join(format!("{id}.by_{category}.csv"));
        reports::write_counts_csv(&by_category, category, &count_active_by(&reconciliation.merged, category))?;
        written.push(by_category);

        let by_period = reports_dir.join(format!("{id}.by_period.csv"));
        reports::write_counts_csv(
            &by_period,
            "period",
            &count_by_period(
                &reconciliation.merged,
                &source.aggregate.period_source(),
                source.aggregate.period,
            ),
        )?;
        written.push(by_period);

        let parquet_path = reports_dir.join(format!("{id}.parquet"));
        reports::write_records_parquet(&parquet_path, source.kind, &reconciliation.merged)?;
        written.push(parquet_path);

        let review_path = reports_dir.join(format!("{id}.review.json"));
        reports::write_json(
            &review_path,
            &ReviewFile {
                source_id: id,
                review_threshold: self.review.threshold(),
                candidates,
            },
        )?;
        written.push(review_path);

        Ok(written)
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    match mime {
        "text/html" => "html",
        "application/json" => "json",
        "text/csv" => "csv",
        _ => "bin",
    }
}

pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    SyncPipeline::new(config)?.run_once().await
}

/// Cron-driven sync. A tick that fires while a run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let running = Arc::new(AtomicBool::new(false));

    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            if running.swap(true, Ordering::SeqCst) {
                warn!("previous sync still running; skipping scheduled tick");
                return;
            }
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    failed = summary.failed_sources(),
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
            running.store(false, Ordering::SeqCst);
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline).await.map(Some)
}
