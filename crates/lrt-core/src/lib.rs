//! Core domain model and snapshot reconciliation engine for LRT.
//!
//! Pure crate: receives already-parsed records, returns reconciled records.
//! No network, filesystem or logging dependencies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod key;
pub mod lifecycle;
pub mod reconcile;

pub use key::{EntityKey, KeyDeriver, MalformedRecordError};
pub use lifecycle::{LifecyclePolicy, PolicyError, ReactivationPolicy, ReconcileMode, ReconcileOptions};
pub use reconcile::{ChangeEvent, Reconciler, Reconciliation, ReconcileSummary};

pub const CRATE_NAME: &str = "lrt-core";

/// Field name to string value, as emitted by an extractor.
pub type RawRecord = BTreeMap<String, String>;

/// Persisted lifecycle columns, in write order, for lifecycle-tracked kinds.
pub const LIFECYCLE_COLUMNS: [&str; 3] = ["active", "activated_on", "deactivated_on"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Meeting,
    Member,
    Legislator,
}

impl EntityKind {
    pub fn schema(self) -> &'static EntitySchema {
        match self {
            Self::Meeting => &MEETING_SCHEMA,
            Self::Member => &MEMBER_SCHEMA,
            Self::Legislator => &LEGISLATOR_SCHEMA,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meeting => write!(f, "meeting"),
            Self::Member => write!(f, "member"),
            Self::Legislator => write!(f, "legislator"),
        }
    }
}

/// Declared field layout of one entity kind.
#[derive(Debug)]
pub struct EntitySchema {
    pub kind: EntityKind,
    /// Data columns in persisted order.
    pub columns: &'static [&'static str],
    /// Default identity fields, in key order.
    pub key_fields: &'static [&'static str],
    /// Default fields refreshed from every snapshot.
    pub snapshot_owned: &'static [&'static str],
    pub lifecycle: bool,
}

impl EntitySchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(&name)
    }

    /// Full persisted header: data columns, then lifecycle columns if tracked.
    pub fn header(&self) -> Vec<&'static str> {
        let mut header = self.columns.to_vec();
        if self.lifecycle {
            header.extend(LIFECYCLE_COLUMNS);
        }
        header
    }
}

pub static MEETING_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Meeting,
    columns: &["group_code", "meeting_id", "date", "text", "source_url"],
    key_fields: &["group_code", "meeting_id"],
    snapshot_owned: &[],
    lifecycle: false,
};

pub static MEMBER_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Member,
    columns: &["group_code", "name", "affiliation", "role", "district"],
    key_fields: &["group_code", "name", "affiliation"],
    snapshot_owned: &["role", "district"],
    lifecycle: true,
};

pub static LEGISLATOR_SCHEMA: EntitySchema = EntitySchema {
    kind: EntityKind::Legislator,
    columns: &[
        "name",
        "profile_url",
        "image_url",
        "affiliation",
        "affiliation_url",
        "mandate_start",
        "mandate_end",
        "extracted_on",
        "email",
        "phone",
        "committees",
    ],
    key_fields: &["name"],
    snapshot_owned: &["affiliation", "image_url", "extracted_on"],
    lifecycle: true,
};

/// Reconciliation-owned state. Never written from snapshot data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub active: bool,
    pub activated_on: Option<NaiveDate>,
    pub deactivated_on: Option<NaiveDate>,
}

impl Lifecycle {
    pub fn activated(on: NaiveDate) -> Self {
        Self {
            active: true,
            activated_on: Some(on),
            deactivated_on: None,
        }
    }

    /// State assumed for rows persisted before lifecycle tracking existed.
    pub fn legacy() -> Self {
        Self {
            active: true,
            activated_on: None,
            deactivated_on: None,
        }
    }
}

/// Typed entity record: declared data fields plus optional lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub fields: BTreeMap<String, String>,
    pub lifecycle: Option<Lifecycle>,
}

impl EntityRecord {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
            lifecycle: None,
        }
    }

    /// Keeps only the schema's data columns; values are trimmed.
    pub fn from_raw(kind: EntityKind, raw: RawRecord) -> Self {
        let schema = kind.schema();
        let fields = raw
            .into_iter()
            .filter(|(name, _)| schema.has_column(name))
            .map(|(name, value)| (name, value.trim().to_string()))
            .collect();
        Self {
            kind,
            fields,
            lifecycle: None,
        }
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Non-empty value of a data field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Records without lifecycle state (meetings, legacy rows) count as active.
    pub fn is_active(&self) -> bool {
        self.lifecycle.map_or(true, |l| l.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_appends_lifecycle_columns_for_tracked_kinds() {
        assert_eq!(
            EntityKind::Member.schema().header(),
            vec![
                "group_code",
                "name",
                "affiliation",
                "role",
                "district",
                "active",
                "activated_on",
                "deactivated_on"
            ]
        );
        assert_eq!(
            EntityKind::Meeting.schema().header(),
            vec!["group_code", "meeting_id", "date", "text", "source_url"]
        );
    }

    #[test]
    fn from_raw_drops_undeclared_fields_and_trims() {
        let mut raw = RawRecord::new();
        raw.insert("name".into(), "  Ana Diaz ".into());
        raw.insert("shoe_size".into(), "41".into());
        let record = EntityRecord::from_raw(EntityKind::Legislator, raw);
        assert_eq!(record.field("name"), Some("Ana Diaz"));
        assert!(!record.fields.contains_key("shoe_size"));
        assert!(record.lifecycle.is_none());
    }

    #[test]
    fn empty_field_reads_as_absent() {
        let record = EntityRecord::new(EntityKind::Member).with_field("role", "");
        assert_eq!(record.field("role"), None);
        assert!(record.is_active());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&EntityKind::Legislator).unwrap();
        assert_eq!(json, "\"legislator\"");
    }
}
