//! Lifecycle tagging policy that parameterizes the reconciler.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::KeyDeriver;
use crate::{EntityKind, EntityRecord, Lifecycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Only new keys are added; existing records are never touched.
    AppendOnly,
    /// Active/inactive tracking with activation and deactivation dates.
    Lifecycle,
}

impl ReconcileMode {
    pub fn default_for(kind: EntityKind) -> Self {
        if kind.schema().lifecycle {
            Self::Lifecycle
        } else {
            Self::AppendOnly
        }
    }
}

/// What happens to `deactivated_on` when an inactive record reappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationPolicy {
    /// Keep the last deactivation date until a new deactivation supersedes it.
    #[default]
    RetainDeactivation,
    ClearDeactivation,
}

/// Recognized reconciliation options; unset values fall back to the schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    #[serde(default)]
    pub run_date: Option<NaiveDate>,
    #[serde(default)]
    pub reconciliation_mode: Option<ReconcileMode>,
    #[serde(default)]
    pub key_fields: Option<Vec<String>>,
    #[serde(default)]
    pub snapshot_owned_fields: Option<Vec<String>>,
    #[serde(default)]
    pub on_reactivation: ReactivationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("{kind} has no field named '{field}'")]
    UnknownField { kind: EntityKind, field: String },
    #[error("{0} needs at least one key field")]
    EmptyKey(EntityKind),
    #[error("key field '{0}' cannot also be snapshot-owned")]
    KeyFieldSnapshotOwned(String),
    #[error("{0} records do not carry lifecycle state; use append_only")]
    LifecycleNotTracked(EntityKind),
}

#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub kind: EntityKind,
    pub run_date: NaiveDate,
    pub mode: ReconcileMode,
    pub key_fields: Vec<String>,
    pub snapshot_owned: BTreeSet<String>,
    pub on_reactivation: ReactivationPolicy,
}

impl LifecyclePolicy {
    /// Resolve options against the kind's schema.
    ///
    /// Default key fields dropped from a custom key become snapshot-owned, so
    /// e.g. a member keyed without affiliation gets affiliation refreshed in place.
    pub fn resolve(
        kind: EntityKind,
        options: &ReconcileOptions,
        today: NaiveDate,
    ) -> Result<Self, PolicyError> {
        let schema = kind.schema();
        let mode = options
            .reconciliation_mode
            .unwrap_or_else(|| ReconcileMode::default_for(kind));
        if mode == ReconcileMode::Lifecycle && !schema.lifecycle {
            return Err(PolicyError::LifecycleNotTracked(kind));
        }

        let key_fields = match &options.key_fields {
            Some(fields) => fields.clone(),
            None => schema.key_fields.iter().map(|f| f.to_string()).collect(),
        };
        if key_fields.is_empty() {
            return Err(PolicyError::EmptyKey(kind));
        }

        let snapshot_owned: BTreeSet<String> = match &options.snapshot_owned_fields {
            Some(fields) => fields.iter().cloned().collect(),
            None => schema
                .snapshot_owned
                .iter()
                .chain(schema.key_fields.iter())
                .map(|f| f.to_string())
                .filter(|f| !key_fields.contains(f))
                .collect(),
        };

        for field in key_fields.iter().chain(snapshot_owned.iter()) {
            if !schema.has_column(field) {
                return Err(PolicyError::UnknownField {
                    kind,
                    field: field.clone(),
                });
            }
        }
        if let Some(field) = key_fields.iter().find(|f| snapshot_owned.contains(*f)) {
            return Err(PolicyError::KeyFieldSnapshotOwned(field.clone()));
        }

        Ok(Self {
            kind,
            run_date: options.run_date.unwrap_or(today),
            mode,
            key_fields,
            snapshot_owned,
            on_reactivation: options.on_reactivation,
        })
    }

    pub fn tracks_lifecycle(&self) -> bool {
        self.kind.schema().lifecycle
    }

    pub fn key_deriver(&self) -> KeyDeriver {
        KeyDeriver::new(self.kind, self.key_fields.clone())
    }

    pub fn is_key_field(&self, field: &str) -> bool {
        self.key_fields.iter().any(|f| f == field)
    }

    pub fn is_snapshot_owned(&self, field: &str) -> bool {
        self.snapshot_owned.contains(field)
    }

    /// First sighting.
    pub fn stamp_created(&self, record: &mut EntityRecord) {
        if self.tracks_lifecycle() {
            record.lifecycle = Some(Lifecycle::activated(self.run_date));
        }
    }

    /// Sighting of a known record. Returns true when this reactivates it.
    pub fn stamp_seen(&self, record: &mut EntityRecord) -> bool {
        let mut lifecycle = record.lifecycle.unwrap_or_else(Lifecycle::legacy);
        let was_inactive = !lifecycle.active;
        lifecycle.active = true;
        if was_inactive && self.on_reactivation == ReactivationPolicy::ClearDeactivation {
            lifecycle.deactivated_on = None;
        }
        record.lifecycle = Some(lifecycle);
        was_inactive
    }

    /// Known record missing from the snapshot. Returns true when it was active.
    pub fn stamp_absent(&self, record: &mut EntityRecord) -> bool {
        let mut lifecycle = record.lifecycle.unwrap_or_else(Lifecycle::legacy);
        if !lifecycle.active {
            return false;
        }
        lifecycle.active = false;
        lifecycle.deactivated_on = Some(self.run_date);
        record.lifecycle = Some(lifecycle);
        true
    }

    /// Copy snapshot-owned values over, fill blank sticky fields, never touch
    /// key fields or lifecycle. Returns the names of fields whose value changed.
    pub fn refresh_fields(&self, existing: &mut EntityRecord, fresh: &EntityRecord) -> Vec<String> {
        let mut changed = Vec::new();
        for column in self.kind.schema().columns {
            if self.is_key_field(column) {
                continue;
            }
            let Some(new_value) = fresh.fields.get(*column) else {
                continue;
            };
            let current = existing.fields.get(*column).map(String::as_str).unwrap_or("");
            let take = if self.is_snapshot_owned(column) {
                current != new_value
            } else {
                current.is_empty() && !new_value.is_empty()
            };
            if take {
                existing.fields.insert(column.to_string(), new_value.clone());
                changed.push(column.to_string());
            }
        }
        changed
    }
}
