//! Flat CSV store for reconciled entity sets.
//!
//! One file per source, one row per entity, header in schema order. Loading
//! checks the header against the kind's schema and normalizes the textual
//! lifecycle columns back into typed values before anything reaches the engine.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use lrt_core::{EntityKind, EntityRecord, Lifecycle, LIFECYCLE_COLUMNS};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreFormatError {
    #[error("{}: cannot read store: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: malformed CSV: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{}: {kind} store is missing key column '{column}'", path.display())]
    MissingColumn {
        path: PathBuf,
        kind: EntityKind,
        column: String,
    },
    #[error("{}: column '{column}' is not part of the {kind} schema", path.display())]
    UnknownColumn {
        path: PathBuf,
        kind: EntityKind,
        column: String,
    },
    #[error("{}: column '{column}' appears more than once", path.display())]
    DuplicateColumn { path: PathBuf, column: String },
    #[error("{}, line {line}: '{value}' is not a boolean in column 'active'", path.display())]
    InvalidBoolean {
        path: PathBuf,
        line: usize,
        value: String,
    },
    #[error("{}, line {line}: '{value}' is not a YYYY-MM-DD date in column '{column}'", path.display())]
    InvalidDate {
        path: PathBuf,
        line: usize,
        column: String,
        value: String,
    },
}

/// Normalize persisted `active` text. Blank means the row predates tracking.
pub fn parse_active(value: &str) -> Option<bool> {
    match value.trim() {
        "" | "1" | "true" | "True" | "TRUE" => Some(true),
        "0" | "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Load the persisted set for `kind`. A missing file is an empty set (first run).
pub fn load_records(path: &Path, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreFormatError> {
    if !path.exists() {
        debug!(path = %path.display(), "no store yet; starting empty");
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|source| StoreFormatError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_records(path, &text, kind)
}

fn parse_records(path: &Path, text: &str, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreFormatError> {
    let schema = kind.schema();
    let csv_err = |source: csv::Error| StoreFormatError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut columns: HashMap<&str, usize> = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let known = schema.has_column(header)
            || (schema.lifecycle && LIFECYCLE_COLUMNS.contains(&header.as_str()));
        if !known {
            return Err(StoreFormatError::UnknownColumn {
                path: path.to_path_buf(),
                kind,
                column: header.clone(),
            });
        }
        if columns.insert(header.as_str(), idx).is_some() {
            return Err(StoreFormatError::DuplicateColumn {
                path: path.to_path_buf(),
                column: header.clone(),
            });
        }
    }
    if let Some(missing) = schema.key_fields.iter().find(|k| !columns.contains_key(*k)) {
        return Err(StoreFormatError::MissingColumn {
            path: path.to_path_buf(),
            kind,
            column: missing.to_string(),
        });
    }

    let mut records = Vec::new();
    for (row_idx, row) in reader.records().enumerate() {
        let row = row.map_err(csv_err)?;
        let line = row_idx + 2;
        let cell = |name: &str| columns.get(name).and_then(|&i| row.get(i)).unwrap_or("");

        let mut record = EntityRecord::new(kind);
        for &column in schema.columns {
            if columns.contains_key(column) {
                record.fields.insert(column.to_string(), cell(column).to_string());
            }
        }

        if schema.lifecycle {
            let active_text = cell("active");
            let active = parse_active(active_text).ok_or_else(|| StoreFormatError::InvalidBoolean {
                path: path.to_path_buf(),
                line,
                value: active_text.to_string(),
            })?;
            let date = |column: &str| -> Result<Option<NaiveDate>, StoreFormatError> {
                let value = cell(column).trim();
                if value.is_empty() {
                    return Ok(None);
                }
                NaiveDate::parse_from_str(value, DATE_FORMAT)
                    .map(Some)
                    .map_err(|_| StoreFormatError::InvalidDate {
                        path: path.to_path_buf(),
                        line,
                        column: column.to_string(),
                        value: value.to_string(),
                    })
            };
            record.lifecycle = Some(Lifecycle {
                active,
                activated_on: date("activated_on")?,
                deactivated_on: date("deactivated_on")?,
            });
        }
        records.push(record);
    }
    Ok(records)
}

/// Write the full set atomically. Every schema column is written, blank when absent.
pub fn save_records(path: &Path, kind: EntityKind, records: &[EntityRecord]) -> anyhow::Result<()> {
    let schema = kind.schema();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("creating store directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "store.csv".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = write_csv(&temp_path, schema.header(), records, schema.columns, schema.lifecycle);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "atomically renaming store {} -> {}",
            temp_path.display(),
            path.display()
        )
    })?;
    debug!(path = %path.display(), rows = records.len(), "store saved");
    Ok(())
}

fn write_csv(
    path: &Path,
    header: Vec<&str>,
    records: &[EntityRecord],
    columns: &[&str],
    lifecycle: bool,
) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    writer
        .write_record(&header)
        .with_context(|| format!("writing header to {}", path.display()))?;

    for record in records {
        let mut row: Vec<String> = columns
            .iter()
            .map(|c| record.fields.get(*c).cloned().unwrap_or_default())
            .collect();
        if lifecycle {
            match record.lifecycle {
                Some(l) => {
                    row.push(l.active.to_string());
                    row.push(format_date(l.activated_on));
                    row.push(format_date(l.deactivated_on));
                }
                None => row.extend([String::new(), String::new(), String::new()]),
            }
        }
        writer
            .write_record(&row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_default()
}
