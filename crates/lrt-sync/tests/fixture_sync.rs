use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use lrt_core::EntityKind;
use lrt_storage::load_records;
use lrt_sync::{SourceStatus, SyncConfig, SyncPipeline};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn config(work: &Path, run_date: &str) -> SyncConfig {
    SyncConfig {
        data_dir: work.join("data"),
        archive_dir: work.join("archive"),
        reports_dir: work.join("reports"),
        sources_path: workspace_root().join("sources.yaml"),
        run_date: NaiveDate::parse_from_str(run_date, "%Y-%m-%d").ok(),
        ..SyncConfig::default()
    }
}

#[tokio::test]
async fn fixture_registry_syncs_and_is_idempotent() {
    let work = tempdir().expect("tempdir");

    let first = SyncPipeline::new(config(work.path(), "2024-06-01"))
        .expect("pipeline")
        .run_once()
        .await
        .expect("first run");
    assert_eq!(first.enabled_sources, 3);
    assert_eq!(first.failed_sources(), 0);
    assert!(first.sources.iter().all(|s| s.status == SourceStatus::Completed));

    let legisladores = first
        .sources
        .iter()
        .find(|s| s.source_id == "legisladores")
        .expect("legisladores outcome");
    assert_eq!(legisladores.summary.map(|s| s.created), Some(3));

    let second = SyncPipeline::new(config(work.path(), "2024-07-01"))
        .expect("pipeline")
        .run_once()
        .await
        .expect("second run");
    for outcome in &second.sources {
        let summary = outcome.summary.expect("summary");
        assert_eq!(summary.created, 0, "{}", outcome.source_id);
        assert_eq!(summary.deactivated, 0, "{}", outcome.source_id);
    }

    let members = load_records(&work.path().join("data/integrantes.csv"), EntityKind::Member)
        .expect("member store");
    assert_eq!(members.len(), 3);
    assert!(members
        .iter()
        .all(|m| m.lifecycle.and_then(|l| l.activated_on) == NaiveDate::from_ymd_opt(2024, 6, 1)));

    let meetings = load_records(&work.path().join("data/reuniones.csv"), EntityKind::Meeting)
        .expect("meeting store");
    assert_eq!(meetings.len(), 2);
    assert!(meetings.iter().all(|m| m.lifecycle.is_none()));
}
