//! Run configuration (environment) and the source registry (`sources.yaml`).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use lrt_adapters::ExtractionRules;
use lrt_core::aggregate::{Period, PeriodSource};
use lrt_core::{EntityKind, ReactivationPolicy, ReconcileMode, ReconcileOptions};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Pinned run date; today when unset.
    pub run_date: Option<NaiveDate>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub allow_empty_snapshot: bool,
    /// Fetch detail pages on every live run, not only the first.
    pub fetch_details: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            archive_dir: PathBuf::from("./archive"),
            reports_dir: PathBuf::from("./reports"),
            sources_path: PathBuf::from("./sources.yaml"),
            user_agent: "lrt-bot/0.1".to_string(),
            http_timeout_secs: 20,
            run_date: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            allow_empty_snapshot: false,
            fetch_details: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let path = |name: &str, default: PathBuf| lookup(name).map(PathBuf::from).unwrap_or(default);
        let flag = |name: &str| {
            lookup(name)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };

        let run_date = match lookup("LRT_RUN_DATE").filter(|v| !v.trim().is_empty()) {
            Some(value) => Some(parse_run_date(&value).context("reading LRT_RUN_DATE")?),
            None => None,
        };

        let http_timeout_secs = match lookup("LRT_HTTP_TIMEOUT_SECS").filter(|v| !v.trim().is_empty()) {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("invalid timeout '{value}', expected whole seconds"))
                .context("reading LRT_HTTP_TIMEOUT_SECS")?,
            None => defaults.http_timeout_secs,
        };

        Ok(Self {
            data_dir: path("LRT_DATA_DIR", defaults.data_dir),
            archive_dir: path("LRT_ARCHIVE_DIR", defaults.archive_dir),
            reports_dir: path("LRT_REPORTS_DIR", defaults.reports_dir),
            sources_path: path("LRT_SOURCES", defaults.sources_path),
            user_agent: lookup("LRT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs,
            run_date,
            scheduler_enabled: flag("LRT_SCHEDULER_ENABLED"),
            sync_cron: lookup("LRT_SYNC_CRON").unwrap_or(defaults.sync_cron),
            allow_empty_snapshot: flag("LRT_ALLOW_EMPTY_SNAPSHOT"),
            fetch_details: flag("LRT_FETCH_DETAILS"),
        })
    }
}

pub fn parse_run_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid run date '{value}', expected YYYY-MM-DD"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Live,
    /// Replay a captured snapshot bundle instead of fetching.
    #[default]
    Bundle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Category field for active counts; a per-kind default when unset.
    #[serde(default)]
    pub by_field: Option<String>,
    /// Date field bucketed by period; the activation date when unset.
    #[serde(default)]
    pub period_field: Option<String>,
    #[serde(default)]
    pub period: Period,
}

impl AggregateConfig {
    pub fn category_field(&self, kind: EntityKind) -> &str {
        match &self.by_field {
            Some(field) => field,
            None => match kind {
                EntityKind::Meeting => "group_code",
                EntityKind::Member | EntityKind::Legislator => "affiliation",
            },
        }
    }

    pub fn period_source(&self) -> PeriodSource {
        match &self.period_field {
            Some(field) => PeriodSource::Field(field.clone()),
            None => PeriodSource::Activation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: EntityKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub bundle_path: Option<PathBuf>,
    #[serde(default)]
    pub store_file: Option<PathBuf>,
    #[serde(default)]
    pub extract: Option<ExtractionRules>,
    #[serde(default)]
    pub reconciliation_mode: Option<ReconcileMode>,
    #[serde(default)]
    pub key_fields: Option<Vec<String>>,
    #[serde(default)]
    pub snapshot_owned_fields: Option<Vec<String>>,
    #[serde(default)]
    pub on_reactivation: ReactivationPolicy,
    #[serde(default)]
    pub allow_empty_snapshot: bool,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    /// Detail pages are fetched on the first run (no store yet) or when
    /// `LRT_FETCH_DETAILS` is set; this overrides both.
    #[serde(default)]
    pub fetch_details: Option<bool>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn reconcile_options(&self, run_date: NaiveDate) -> ReconcileOptions {
        ReconcileOptions {
            run_date: Some(run_date),
            reconciliation_mode: self.reconciliation_mode,
            key_fields: self.key_fields.clone(),
            snapshot_owned_fields: self.snapshot_owned_fields.clone(),
            on_reactivation: self.on_reactivation,
        }
    }

    pub fn wants_details(&self, always: bool, store_exists: bool) -> bool {
        self.fetch_details.unwrap_or(always || !store_exists)
    }

    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        match &self.store_file {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => data_dir.join(file),
            None => data_dir.join(format!("{}.csv", self.source_id)),
        }
    }

    /// Relative bundle paths resolve against the registry file's directory.
    pub fn bundle_path(&self, registry_root: &Path) -> PathBuf {
        match &self.bundle_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => registry_root.join(path),
            None => registry_root
                .join("fixtures")
                .join(&self.source_id)
                .join("sample")
                .join("bundle.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(skip)]
    root: PathBuf,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&text, root).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str, root: PathBuf) -> Result<Self> {
        let mut registry: Self = serde_yaml::from_str(text)?;
        registry.root = root;
        registry.validate()?;
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    // One writer per store file.
    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        let mut stores = BTreeSet::new();
        for source in &self.sources {
            if !ids.insert(source.source_id.as_str()) {
                bail!("duplicate source_id '{}'", source.source_id);
            }
            let store = source.store_path(Path::new(""));
            if !stores.insert(store.clone()) {
                bail!(
                    "source '{}' shares store file {} with another source",
                    source.source_id,
                    store.display()
                );
            }
            if source.mode == SourceMode::Live && source.extract.is_none() {
                bail!("live source '{}' needs extract rules", source.source_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REGISTRY: &str = r#"
sources:
  - source_id: legisladores
    kind: legislator
  - source_id: integrantes
    kind: member
    enabled: false
    key_fields: [group_code, name]
    on_reactivation: clear_deactivation
    aggregate:
      period: month
      period_field: mandate_start
  - source_id: reuniones
    kind: meeting
    mode: live
    listing_urls: ["https://www.hcdn.gob.ar/comisiones/permanentes/"]
    store_file: meetings/reuniones.csv
    extract:
      row_selector: "a[href*='id_reunion']"
      fields:
        - field: meeting_id
          attr: href
          query_param: id_reunion
"#;

    #[test]
    fn env_lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LRT_DATA_DIR", "/srv/lrt/data"),
            ("LRT_RUN_DATE", "2024-06-01"),
            ("LRT_HTTP_TIMEOUT_SECS", "5"),
            ("LRT_ALLOW_EMPTY_SNAPSHOT", "true"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/lrt/data"));
        assert_eq!(config.archive_dir, PathBuf::from("./archive"));
        assert_eq!(config.run_date, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(config.http_timeout_secs, 5);
        assert!(config.allow_empty_snapshot);
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn malformed_run_date_is_an_error() {
        let err = SyncConfig::from_lookup(|k| (k == "LRT_RUN_DATE").then(|| "01/06/2024".to_string()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("LRT_RUN_DATE"));
    }

    #[test]
    fn malformed_http_timeout_is_an_error() {
        let err = SyncConfig::from_lookup(|k| (k == "LRT_HTTP_TIMEOUT_SECS").then(|| "20s".to_string()))
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("LRT_HTTP_TIMEOUT_SECS"));
        assert!(message.contains("20s"));

        let config = SyncConfig::from_lookup(|k| (k == "LRT_HTTP_TIMEOUT_SECS").then(|| " 45 ".to_string()))
            .unwrap();
        assert_eq!(config.http_timeout_secs, 45);
    }

    #[test]
    fn registry_parses_with_defaults() {
        let registry = SourceRegistry::from_yaml(REGISTRY, PathBuf::from("/etc/lrt")).unwrap();
        let enabled: Vec<_> = registry.enabled().map(|s| s.source_id.as_str()).collect();
        assert_eq!(enabled, vec!["legisladores", "reuniones"]);

        let legisladores = registry.get("legisladores").unwrap();
        assert_eq!(legisladores.mode, SourceMode::Bundle);
        assert_eq!(
            legisladores.bundle_path(registry.root()),
            PathBuf::from("/etc/lrt/fixtures/legisladores/sample/bundle.json")
        );
        assert_eq!(
            legisladores.store_path(Path::new("data")),
            PathBuf::from("data/legisladores.csv")
        );
        assert_eq!(legisladores.aggregate.category_field(legisladores.kind), "affiliation");

        let integrantes = registry.get("integrantes").unwrap();
        let options = integrantes.reconcile_options(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(options.key_fields, Some(vec!["group_code".to_string(), "name".to_string()]));
        assert_eq!(options.on_reactivation, ReactivationPolicy::ClearDeactivation);
        assert_eq!(integrantes.aggregate.period, Period::Month);
        assert_eq!(
            integrantes.aggregate.period_source(),
            PeriodSource::Field("mandate_start".to_string())
        );
        assert_eq!(legisladores.aggregate.period_source(), PeriodSource::Activation);

        let reuniones = registry.get("reuniones").unwrap();
        assert_eq!(
            reuniones.store_path(Path::new("data")),
            PathBuf::from("data/meetings/reuniones.csv")
        );
        assert_eq!(reuniones.aggregate.category_field(reuniones.kind), "group_code");
    }

    #[test]
    fn bundled_registry_is_valid() {
        let text = include_str!("../../../sources.yaml");
        let registry = SourceRegistry::from_yaml(text, PathBuf::from(".")).unwrap();
        assert_eq!(registry.enabled().count(), 3);
        assert!(registry.sources.iter().any(|s| s.mode == SourceMode::Live));

        let detail = registry
            .get("diputados-live")
            .and_then(|s| s.extract.as_ref())
            .and_then(|rules| rules.detail.as_ref())
            .unwrap();
        assert_eq!(detail.url_field, "profile_url");
        let fields: Vec<_> = detail.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["email", "phone", "committees"]);
    }

    #[test]
    fn detail_pages_follow_the_first_run_unless_overridden() {
        let registry = SourceRegistry::from_yaml(REGISTRY, PathBuf::from(".")).unwrap();
        let mut source = registry.get("legisladores").unwrap().clone();

        assert!(source.wants_details(false, false));
        assert!(!source.wants_details(false, true));
        assert!(source.wants_details(true, true));

        source.fetch_details = Some(false);
        assert!(!source.wants_details(true, false));
        source.fetch_details = Some(true);
        assert!(source.wants_details(false, true));

        let config = SyncConfig::from_lookup(|k| (k == "LRT_FETCH_DETAILS").then(|| "true".to_string()))
            .unwrap();
        assert!(config.fetch_details);
        assert!(!SyncConfig::default().fetch_details);
    }

    #[test]
    fn registry_rejects_shared_stores_and_live_sources_without_rules() {
        let shared = r#"
sources:
  - source_id: a
    kind: member
    store_file: integrantes.csv
  - source_id: b
    kind: member
    store_file: integrantes.csv
"#;
        let err = SourceRegistry::from_yaml(shared, PathBuf::from(".")).unwrap_err();
        assert!(err.to_string().contains("shares store file"));

        let live = r#"
sources:
  - source_id: a
    kind: legislator
    mode: live
"#;
        let err = SourceRegistry::from_yaml(live, PathBuf::from(".")).unwrap_err();
        assert!(err.to_string().contains("extract rules"));
    }
}
