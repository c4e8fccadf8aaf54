use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use lrt_adapters::load_snapshot_bundle;
use lrt_core::aggregate::{count_active_by, count_by_period, Period};
use lrt_core::{EntityKind, ReactivationPolicy, ReconcileMode, ReconcileOptions};
use lrt_storage::load_records;
use lrt_sync::config::parse_run_date;
use lrt_sync::{build_scheduler, reconcile_store, AggregateConfig, StoreReconcile, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lrt")]
#[command(about = "Legislative roster tracker: reconcile roster and meeting snapshots")]
struct Cli {
    /// Date stamped on lifecycle changes (YYYY-MM-DD). Overrides LRT_RUN_DATE.
    #[arg(long, global = true)]
    run_date: Option<String>,
    /// Source registry. Overrides LRT_SOURCES.
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture and reconcile every enabled source once.
    Sync {
        #[arg(long)]
        allow_empty_snapshot: bool,
    },
    /// Reconcile one store file against a captured snapshot bundle.
    Reconcile(ReconcileArgs),
    /// Summary counts over a store file.
    Aggregate(AggregateArgs),
    /// Run the sync on LRT_SYNC_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Args)]
struct ReconcileArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    snapshot: PathBuf,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long, value_delimiter = ',')]
    key_fields: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    snapshot_owned_fields: Option<Vec<String>>,
    /// Clear the deactivation date when a record reappears.
    #[arg(long)]
    clear_deactivation: bool,
    #[arg(long)]
    allow_empty_snapshot: bool,
    /// Report what would change without writing the store.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AggregateArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    store: PathBuf,
    /// Category field for active counts: `group_code` for meetings,
    /// `affiliation` otherwise.
    #[arg(long)]
    by: Option<String>,
    #[arg(long, value_enum, default_value_t = PeriodArg::Year)]
    period: PeriodArg,
    /// Date field to bucket by instead of the activation date.
    #[arg(long)]
    period_field: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Meeting,
    Member,
    Legislator,
}

impl From<KindArg> for EntityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Meeting => EntityKind::Meeting,
            KindArg::Member => EntityKind::Member,
            KindArg::Legislator => EntityKind::Legislator,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    AppendOnly,
    Lifecycle,
}

impl From<ModeArg> for ReconcileMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::AppendOnly => ReconcileMode::AppendOnly,
            ModeArg::Lifecycle => ReconcileMode::Lifecycle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PeriodArg {
    Year,
    Month,
}

impl From<PeriodArg> for Period {
    fn from(value: PeriodArg) -> Self {
        match value {
            PeriodArg::Year => Period::Year,
            PeriodArg::Month => Period::Month,
        }
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env()?;
    if let Some(date) = &cli.run_date {
        config.run_date = Some(parse_run_date(date)?);
    }
    if let Some(path) = &cli.sources {
        config.sources_path = path.clone();
    }
    if let Some(path) = &cli.data_dir {
        config.data_dir = path.clone();
    }
    if let Some(path) = &cli.reports_dir {
        config.reports_dir = path.clone();
    }
    Ok(config)
}

fn aggregate_config(by: Option<String>, period_field: Option<String>, period: PeriodArg) -> AggregateConfig {
    AggregateConfig {
        by_field: by,
        period_field,
        period: period.into(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Sync {
        allow_empty_snapshot: false,
    }) {
        Commands::Sync {
            allow_empty_snapshot,
        } => {
            config.allow_empty_snapshot |= allow_empty_snapshot;
            let summary = lrt_sync::run_sync_once(config).await?;
            println!(
                "sync complete: run_id={} run_date={} sources={} failed={} reports={}",
                summary.run_id,
                summary.run_date,
                summary.enabled_sources,
                summary.failed_sources(),
                summary.reports_dir
            );
            for source in &summary.sources {
                match (&source.summary, &source.reason) {
                    (Some(counts), _) => println!(
                        "  {}: created={} updated={} deactivated={} reactivated={} malformed={}",
                        source.source_id,
                        counts.created,
                        counts.updated,
                        counts.deactivated,
                        counts.reactivated,
                        counts.malformed
                    ),
                    (None, reason) => println!(
                        "  {}: failed: {}",
                        source.source_id,
                        reason.as_deref().unwrap_or("unknown")
                    ),
                }
            }
            if summary.failed_sources() > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Reconcile(args) => {
            let bundle = load_snapshot_bundle(&args.snapshot)?;
            let today = config
                .run_date
                .unwrap_or_else(|| Local::now().date_naive());
            let options = ReconcileOptions {
                run_date: config.run_date,
                reconciliation_mode: args.mode.map(Into::into),
                key_fields: args.key_fields,
                snapshot_owned_fields: args.snapshot_owned_fields,
                on_reactivation: if args.clear_deactivation {
                    ReactivationPolicy::ClearDeactivation
                } else {
                    ReactivationPolicy::RetainDeactivation
                },
            };
            let result = reconcile_store(
                &StoreReconcile {
                    source_id: &bundle.source_id,
                    store_path: &args.store,
                    kind: bundle.kind,
                    options: &options,
                    today,
                    allow_empty_snapshot: args.allow_empty_snapshot || config.allow_empty_snapshot,
                },
                bundle.records,
                !args.dry_run,
            )?;
            let report = serde_json::json!({
                "store": args.store.display().to_string(),
                "kind": bundle.kind,
                "dry_run": args.dry_run,
                "summary": result.summary,
                "changes": result.changes,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing reconcile report")?
            );
        }
        Commands::Aggregate(args) => {
            let kind = EntityKind::from(args.kind);
            let records = load_records(&args.store, kind)
                .with_context(|| format!("loading store {}", args.store.display()))?;
            let aggregate = aggregate_config(args.by, args.period_field, args.period);
            let by = aggregate.category_field(kind);
            let report = serde_json::json!({
                "store": args.store.display().to_string(),
                "kind": kind,
                "records": records.len(),
                "by": by,
                "active_by": count_active_by(&records, by),
                "by_period": count_by_period(&records, &aggregate.period_source(), aggregate.period),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing aggregate report")?
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(%cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate_args(argv: &[&str]) -> AggregateArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Some(Commands::Aggregate(args)) => args,
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_category_defaults_per_kind() {
        let args = aggregate_args(&["lrt", "aggregate", "--kind", "meeting", "--store", "r.csv"]);
        let config = aggregate_config(args.by, args.period_field, args.period);
        assert_eq!(config.category_field(EntityKind::from(args.kind)), "group_code");

        let args = aggregate_args(&["lrt", "aggregate", "--kind", "member", "--store", "i.csv"]);
        let config = aggregate_config(args.by, args.period_field, args.period);
        assert_eq!(config.category_field(EntityKind::from(args.kind)), "affiliation");
    }

    #[test]
    fn explicit_category_and_period_field_win() {
        let args = aggregate_args(&[
            "lrt",
            "aggregate",
            "--kind",
            "legislator",
            "--store",
            "l.csv",
            "--by",
            "mandate_end",
            "--period",
            "month",
            "--period-field",
            "mandate_start",
        ]);
        let config = aggregate_config(args.by, args.period_field, args.period);
        assert_eq!(config.category_field(EntityKind::Legislator), "mandate_end");
        assert_eq!(config.period, Period::Month);
        assert_eq!(
            config.period_source(),
            lrt_core::aggregate::PeriodSource::Field("mandate_start".to_string())
        );
    }
}
