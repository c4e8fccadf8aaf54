//! Immutable, content-addressed archive of everything a run captured.
//!
//! Layout: `<root>/<YYYYmmdd_HHMMSS>/<source_id>/<sha256>.<ext>`. A file is
//! never rewritten once present.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    /// Path below the archive root.
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when identical bytes were already archived for this capture.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let mut path = PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string());
        path.push(source_id);
        path.push(format!("{content_hash}.{ext}"));
        path
    }

    /// Archive `bytes` captured for `source_id`. Writes go through a temp
    /// file and a rename so a reader never sees a partial file.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(captured_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let mut snapshot = ArchivedSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        };

        let dir = match snapshot.absolute_path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => anyhow::bail!("archive path {} has no parent", snapshot.absolute_path.display()),
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        if fs::metadata(&snapshot.absolute_path).await.is_ok() {
            debug!(path = %snapshot.relative_path.display(), "already archived");
            snapshot.deduplicated = true;
            return Ok(snapshot);
        }

        let partial = dir.join(format!(".{}.{}.part", snapshot.content_hash, Uuid::new_v4()));
        write_new_file(&partial, bytes).await?;

        if let Err(err) = fs::rename(&partial, &snapshot.absolute_path).await {
            let _ = fs::remove_file(&partial).await;
            if err.kind() != ErrorKind::AlreadyExists {
                return Err(err).with_context(|| {
                    format!("moving {} into the archive", snapshot.relative_path.display())
                });
            }
            snapshot.deduplicated = true;
        }
        Ok(snapshot)
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))
}
