//! Snapshot reconciliation: merge a fresh snapshot into persisted history.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::key::{EntityKey, KeyDeriver, MalformedRecordError};
use crate::lifecycle::{LifecyclePolicy, ReconcileMode};
use crate::{EntityRecord, RawRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deactivated: usize,
    pub reactivated: usize,
    /// Inactive records still absent; left untouched.
    pub unchanged_inactive: usize,
    /// Snapshot records overwritten by a later record with the same key.
    pub duplicate_snapshot_keys: usize,
    /// Later duplicates found in the existing set and folded into the first.
    pub collapsed_existing: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    Created { key: EntityKey },
    Updated { key: EntityKey, changed_fields: Vec<String> },
    Reactivated { key: EntityKey, changed_fields: Vec<String> },
    Deactivated { key: EntityKey },
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub merged: Vec<EntityRecord>,
    pub summary: ReconcileSummary,
    pub changes: Vec<ChangeEvent>,
    /// Records skipped (snapshot) or kept verbatim (existing) for lack of a key.
    pub malformed: Vec<MalformedRecordError>,
}

impl Reconciliation {
    fn empty() -> Self {
        Self {
            merged: Vec::new(),
            summary: ReconcileSummary::default(),
            changes: Vec::new(),
            malformed: Vec::new(),
        }
    }

    fn reject(&mut self, err: MalformedRecordError) {
        self.summary.malformed += 1;
        self.malformed.push(err);
    }
}

/// Keyed snapshot: last occurrence wins, first-seen order is kept.
struct SnapshotIndex {
    records: HashMap<EntityKey, EntityRecord>,
    order: Vec<EntityKey>,
}

pub struct Reconciler {
    policy: LifecyclePolicy,
    keys: KeyDeriver,
}

impl Reconciler {
    pub fn new(policy: LifecyclePolicy) -> Self {
        let keys = policy.key_deriver();
        Self { policy, keys }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn key_of(&self, record: &EntityRecord) -> Result<EntityKey, MalformedRecordError> {
        self.keys.derive_key(&record.fields)
    }

    /// Merge `snapshot` into `existing`. Never fails as a whole: records that
    /// cannot yield a key are reported in `malformed`.
    pub fn reconcile(&self, existing: Vec<EntityRecord>, snapshot: Vec<RawRecord>) -> Reconciliation {
        let mut out = Reconciliation::empty();
        let index = self.index_snapshot(snapshot, &mut out);
        match self.policy.mode {
            ReconcileMode::AppendOnly => self.append_only(existing, index, &mut out),
            ReconcileMode::Lifecycle => self.track_lifecycle(existing, index, &mut out),
        }
        out
    }

    fn index_snapshot(&self, snapshot: Vec<RawRecord>, out: &mut Reconciliation) -> SnapshotIndex {
        let mut records = HashMap::with_capacity(snapshot.len());
        let mut order = Vec::with_capacity(snapshot.len());
        for raw in snapshot {
            let key = match self.keys.derive_key(&raw) {
                Ok(key) => key,
                Err(err) => {
                    out.reject(err);
                    continue;
                }
            };
            let record = EntityRecord::from_raw(self.policy.kind, raw);
            if records.insert(key.clone(), record).is_some() {
                out.summary.duplicate_snapshot_keys += 1;
            } else {
                order.push(key);
            }
        }
        SnapshotIndex { records, order }
    }

    fn append_only(&self, existing: Vec<EntityRecord>, mut index: SnapshotIndex, out: &mut Reconciliation) {
        let mut seen = HashSet::with_capacity(existing.len() + index.order.len());
        for record in existing {
            match self.key_of(&record) {
                Ok(key) => {
                    if !seen.insert(key) {
                        out.summary.collapsed_existing += 1;
                        continue;
                    }
                }
                Err(err) => out.reject(err),
            }
            out.merged.push(record);
        }

        for key in index.order {
            if seen.contains(&key) {
                continue;
            }
            let Some(mut record) = index.records.remove(&key) else {
                continue;
            };
            self.policy.stamp_created(&mut record);
            out.merged.push(record);
            out.summary.created += 1;
            out.changes.push(ChangeEvent::Created { key: key.clone() });
            seen.insert(key);
        }
    }

    fn track_lifecycle(&self, existing: Vec<EntityRecord>, mut index: SnapshotIndex, out: &mut Reconciliation) {
        let mut seen = HashSet::with_capacity(existing.len());
        for mut record in existing {
            let key = match self.key_of(&record) {
                Ok(key) => key,
                Err(err) => {
                    out.reject(err);
                    out.merged.push(record);
                    continue;
                }
            };
            if !seen.insert(key.clone()) {
                out.summary.collapsed_existing += 1;
                continue;
            }

            if let Some(fresh) = index.records.remove(&key) {
                let changed_fields = self.policy.refresh_fields(&mut record, &fresh);
                if self.policy.stamp_seen(&mut record) {
                    out.summary.reactivated += 1;
                    out.changes.push(ChangeEvent::Reactivated { key, changed_fields });
                } else {
                    out.summary.updated += 1;
                    out.changes.push(ChangeEvent::Updated { key, changed_fields });
                }
            } else if self.policy.stamp_absent(&mut record) {
                out.summary.deactivated += 1;
                out.changes.push(ChangeEvent::Deactivated { key });
            } else {
                out.summary.unchanged_inactive += 1;
            }
            out.merged.push(record);
        }

        for key in index.order {
            let Some(mut record) = index.records.remove(&key) else {
                continue;
            };
            self.policy.stamp_created(&mut record);
            out.merged.push(record);
            out.summary.created += 1;
            out.changes.push(ChangeEvent::Created { key });
        }
    }
}
