//! Sidecar persistence for progress records.
//!
//! One text file per transfer, `<progress_dir>/<id>.progress`. Every write
//! replaces the whole file through a temp file and a rename, so readers see
//! either the old record or the new one.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::PROGRESS_SUFFIX;
use crate::error::{Result, TransferError};
use crate::state::{ProgressRecord, TransferStatus};

const TMP_PREFIX: &str = ".tmp.";

#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    sync: bool,
}

/// A record found by [`ProgressStore::scan`].
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: String,
    pub path: PathBuf,
    pub record: ProgressRecord,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync: false,
        }
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, PROGRESS_SUFFIX))
    }

    pub async fn load(&self, id: &str) -> Result<Option<ProgressRecord>> {
        let path = self.record_path(id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TransferError::io(path, e)),
        };
        ProgressRecord::parse(&text)
            .map(Some)
            .map_err(|reason| TransferError::corrupt(path, reason))
    }

    pub async fn save(&self, id: &str, record: &ProgressRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TransferError::io(&self.dir, e))?;

        let path = self.record_path(id);
        let tmp_path = self
            .dir
            .join(format!("{}{}.{}", TMP_PREFIX, uuid::Uuid::new_v4(), PROGRESS_SUFFIX));

        if let Err(e) = self.write_tmp(&tmp_path, record).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferError::io(tmp_path, e));
        }

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferError::io(path, e));
        }

        tracing::trace!(id, downloaded = record.downloaded, status = %record.status, "checkpoint written");
        Ok(())
    }

    async fn write_tmp(&self, tmp_path: &Path, record: &ProgressRecord) -> std::io::Result<()> {
        let mut file = fs::File::create(tmp_path).await?;
        file.write_all(record.to_text().as_bytes()).await?;
        if self.sync {
            file.sync_all().await?;
        } else {
            file.flush().await?;
        }
        Ok(())
    }

    /// Delete the record; a missing record is not an error.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::io(path, e)),
        }
    }

    /// Every parseable record in the directory. Corrupt records are logged and skipped.
    pub async fn scan(&self) -> Result<Vec<StoredRecord>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(TransferError::io(&self.dir, e)),
        };

        let mut found = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransferError::io(&self.dir, e))?
        {
            let path = entry.path();
            let Some(id) = record_id(&path) else {
                continue;
            };

            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable progress record");
                    continue;
                }
            };

            match ProgressRecord::parse(&text) {
                Ok(record) => found.push(StoredRecord { id, path, record }),
                Err(reason) => {
                    let err = TransferError::corrupt(&path, reason);
                    tracing::warn!(error = %err, "Skipping progress record");
                }
            }
        }

        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    /// Records a caller may re-attach: everything not left `in-progress`.
    ///
    /// An `in-progress` record on disk means the process died without a clean
    /// pause; those are only resumed on explicit request.
    pub async fn list_resumable(&self) -> Result<Vec<StoredRecord>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.record.status != TransferStatus::InProgress)
            .collect())
    }
}

fn record_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with(TMP_PREFIX) {
        return None;
    }
    let id = name.strip_suffix(PROGRESS_SUFFIX)?.strip_suffix('.')?;
    (!id.is_empty()).then(|| id.to_string())
}
