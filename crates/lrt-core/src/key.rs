//! Identity derivation: stable natural keys from a fixed subset of fields.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::EntityKind;

/// Natural key of an entity. Equal keys denote the same entity across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(Vec<String>);

impl EntityKey {
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" | "))
    }
}

impl Serialize for EntityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} record cannot yield a key: field '{field}' is missing or empty")]
pub struct MalformedRecordError {
    pub kind: EntityKind,
    pub field: String,
    pub record: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct KeyDeriver {
    kind: EntityKind,
    fields: Vec<String>,
}

impl KeyDeriver {
    pub fn new(kind: EntityKind, fields: Vec<String>) -> Self {
        Self { kind, fields }
    }

    pub fn for_kind(kind: EntityKind) -> Self {
        Self::new(
            kind,
            kind.schema().key_fields.iter().map(|f| f.to_string()).collect(),
        )
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn derive_key(&self, record: &BTreeMap<String, String>) -> Result<EntityKey, MalformedRecordError> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = record
                .get(field)
                .map(|v| normalize_key_value(v))
                .unwrap_or_default();
            if value.is_empty() {
                return Err(MalformedRecordError {
                    kind: self.kind,
                    field: field.clone(),
                    record: record.clone(),
                });
            }
            parts.push(value);
        }
        Ok(EntityKey(parts))
    }
}

/// Trim and collapse internal whitespace runs to one space. Case is kept.
pub fn normalize_key_value(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn member_key_uses_group_name_and_affiliation() {
        let deriver = KeyDeriver::for_kind(EntityKind::Member);
        let key = deriver
            .derive_key(&record(&[
                ("group_code", "PRESUPUESTO"),
                ("name", "Ana  Diaz\n"),
                ("affiliation", "Bloque X"),
                ("role", "Vocal"),
            ]))
            .unwrap();
        assert_eq!(key.to_string(), "PRESUPUESTO | Ana Diaz | Bloque X");
    }

    #[test]
    fn role_drift_does_not_change_identity() {
        let deriver = KeyDeriver::for_kind(EntityKind::Member);
        let a = deriver
            .derive_key(&record(&[("group_code", "G"), ("name", "N"), ("affiliation", "A"), ("role", "Vocal")]))
            .unwrap();
        let b = deriver
            .derive_key(&record(&[("group_code", "G"), ("name", "N"), ("affiliation", "A"), ("role", "Presidente")]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_or_blank_key_field_is_malformed() {
        let deriver = KeyDeriver::for_kind(EntityKind::Meeting);
        let err = deriver
            .derive_key(&record(&[("group_code", "G"), ("meeting_id", "   ")]))
            .unwrap_err();
        assert_eq!(err.field, "meeting_id");
        assert_eq!(err.kind, EntityKind::Meeting);

        let err = deriver.derive_key(&record(&[("meeting_id", "7")])).unwrap_err();
        assert_eq!(err.field, "group_code");
    }

    #[test]
    fn key_serializes_as_display_string() {
        let key = KeyDeriver::for_kind(EntityKind::Legislator)
            .derive_key(&record(&[("name", "Ana Diaz")]))
            .unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"Ana Diaz\"");
    }
}
