//! Machine-readable run outputs: change logs, aggregate CSVs, parquet
//! snapshots of the reconciled set and the hash manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use lrt_core::{
    ChangeEvent, EntityKind, EntityRecord, Lifecycle, MalformedRecordError, ReconcileSummary,
};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::review::SplitCandidate;

#[derive(Debug, Clone, Serialize)]
pub struct MalformedEntry {
    pub missing_field: String,
    pub record: BTreeMap<String, String>,
}

impl From<&MalformedRecordError> for MalformedEntry {
    fn from(err: &MalformedRecordError) -> Self {
        Self {
            missing_field: err.field.clone(),
            record: err.record.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeLog<'a> {
    pub source_id: &'a str,
    pub kind: EntityKind,
    pub run_date: NaiveDate,
    pub summary: ReconcileSummary,
    pub changes: &'a [ChangeEvent],
    pub malformed: Vec<MalformedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewFile<'a> {
    pub source_id: &'a str,
    pub review_threshold: f64,
    pub candidates: &'a [SplitCandidate],
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))
}

/// Two-column CSV: `<label>,count`, one row per bucket in key order.
pub fn write_counts_csv(path: &Path, label: &str, counts: &BTreeMap<String, usize>) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer.write_record([label, "count"])?;
    for (bucket, count) in counts {
        writer.write_record([bucket.as_str(), count.to_string().as_str()])?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Every schema column as nullable Utf8; lifecycle kinds add `active`
/// (Boolean) and the two dates as `%Y-%m-%d` strings.
pub fn write_records_parquet(path: &Path, kind: EntityKind, records: &[EntityRecord]) -> Result<()> {
    let schema = kind.schema();
    let mut fields = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();

    for &column in schema.columns {
        fields.push(ArrowField::new(column, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(
            records.iter().map(|r| r.field(column)).collect::<Vec<_>>(),
        )));
    }

    if schema.lifecycle {
        fields.push(ArrowField::new("active", DataType::Boolean, true));
        columns.push(Arc::new(BooleanArray::from(
            records
                .iter()
                .map(|r| r.lifecycle.map(|l| l.active))
                .collect::<Vec<_>>(),
        )));
        fields.push(ArrowField::new("activated_on", DataType::Utf8, true));
        columns.push(date_column(records, |l| l.activated_on));
        fields.push(ArrowField::new("deactivated_on", DataType::Utf8, true));
        columns.push(date_column(records, |l| l.deactivated_on));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .with_context(|| format!("building {kind} record batch"))?;
    write_parquet(path, batch)
}

fn date_column(records: &[EntityRecord], pick: impl Fn(&Lifecycle) -> Option<NaiveDate>) -> ArrayRef {
    Arc::new(StringArray::from(
        records
            .iter()
            .map(|r| {
                r.lifecycle
                    .as_ref()
                    .and_then(&pick)
                    .map(|d| d.format("%Y-%m-%d").to_string())
            })
            .collect::<Vec<_>>(),
    ))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn manifest_entry(reports_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(reports_dir).unwrap_or(path);
    Ok(ManifestFile {
        name: rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: rel.display().to_string(),
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Write `manifest.json` over `files`, sorted by path.
pub fn write_manifest(reports_dir: &Path, files: &[PathBuf]) -> Result<PathBuf> {
    let mut entries = files
        .iter()
        .map(|path| manifest_entry(reports_dir, path))
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    let manifest = ReportManifest {
        schema_version: 1,
        files: entries,
    };
    let manifest_path = reports_dir.join("manifest.json");
    write_json(&manifest_path, &manifest)?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use tempfile::tempdir;

    #[test]
    fn counts_csv_has_header_and_sorted_buckets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("by_affiliation.csv");
        let counts = BTreeMap::from([("Bloque Y".to_string(), 1), ("Bloque X".to_string(), 2)]);
        write_counts_csv(&path, "affiliation", &counts).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "affiliation,count\nBloque X,2\nBloque Y,1\n");
    }

    #[test]
    fn parquet_snapshot_carries_every_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legisladores.parquet");
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let records = vec![
            EntityRecord::new(EntityKind::Legislator)
                .with_field("name", "Ana")
                .with_lifecycle(Lifecycle::activated(day)),
            EntityRecord::new(EntityKind::Legislator)
                .with_field("name", "Beto")
                .with_lifecycle(Lifecycle::legacy()),
        ];
        write_records_parquet(&path, EntityKind::Legislator, &records).unwrap();

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        let meta = reader.metadata();
        assert_eq!(meta.file_metadata().num_rows(), 2);
        assert_eq!(
            meta.file_metadata().schema_descr().num_columns(),
            EntityKind::Legislator.schema().columns.len() + 3
        );
    }

    #[test]
    fn manifest_hashes_files_relative_to_reports_dir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("run_summary.json");
        std::fs::write(&file, b"hello world").unwrap();
        let manifest_path = write_manifest(dir.path(), &[file]).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        let entry = &manifest["files"][0];
        assert_eq!(entry["path"], "run_summary.json");
        assert_eq!(entry["bytes"], 11);
        assert_eq!(
            entry["sha256"],
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
