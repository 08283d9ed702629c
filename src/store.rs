//! Attachment storage and the metadata log

use crate::error::{Error, Result};
use crate::sanitize::sanitize_filename;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Metadata persisted for every saved attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// RFC 3339 time the attachment was written.
    pub timestamp: String,
    pub sender: String,
    pub subject: String,
    pub original_filename: String,
    pub saved_filename: String,
    pub file_size: u64,
    pub file_path: PathBuf,
}

/// Writes attachments into a directory and appends one JSON line per
/// saved attachment to the metadata log.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
    metadata_log: PathBuf,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>, metadata_log: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            metadata_log: metadata_log.into(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `payload` under its sanitized name and record it.
    ///
    /// The data file is synced before the record is appended. An
    /// existing file with the same name is never overwritten; that
    /// collision surfaces as [`Error::Storage`]. When the record cannot
    /// be appended the data file is removed again, so a failed save
    /// leaves nothing behind and can be retried.
    pub async fn save(
        &self,
        payload: &[u8],
        filename: &str,
        sender: &str,
        subject: &str,
        timestamp: &str,
    ) -> Result<AttachmentRecord> {
        let saved_filename = sanitize_filename(sender, filename, timestamp);
        let file_path = self.dir.join(&saved_filename);

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Storage(format!("Cannot create {}: {e}", self.dir.display()))
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot create {}: {e}", file_path.display())))?;
        let written = match file.write_all(payload).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            discard(&file_path).await;
            return Err(Error::Storage(format!("Cannot write {}: {e}", file_path.display())));
        }

        let record = AttachmentRecord {
            timestamp: chrono::Local::now().to_rfc3339(),
            sender: sender.to_string(),
            subject: subject.to_string(),
            original_filename: filename.to_string(),
            saved_filename,
            file_size: payload.len() as u64,
            file_path,
        };

        if let Err(e) = self.append_record(&record).await {
            discard(&record.file_path).await;
            return Err(e);
        }

        tracing::info!(
            file = %record.saved_filename,
            size = record.file_size,
            sender = %record.sender,
            "Saved attachment"
        );
        Ok(record)
    }

    async fn append_record(&self, record: &AttachmentRecord) -> Result<()> {
        let log = self.metadata_log.display();
        if let Some(parent) = self.metadata_log.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Cannot create log dir for {log}: {e}")))?;
        }
        let mut line =
            serde_json::to_string(record).map_err(|e| Error::Storage(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.metadata_log)
            .await
            .map_err(|e| Error::Storage(format!("Cannot open {log}: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Storage(format!("Cannot append to {log}: {e}")))
    }

    /// Read back every record in the metadata log.
    ///
    /// A missing log yields no records; malformed lines are skipped.
    /// This reads synchronously and is meant for reporting.
    pub fn read_records(&self) -> Result<Vec<AttachmentRecord>> {
        let file = match fs::File::open(&self.metadata_log) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(e.to_string())),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::Storage(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping malformed metadata line: {e}"),
            }
        }
        Ok(records)
    }
}

/// Remove a partially saved file; a leftover would block the retry.
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(file = %path.display(), error = %e, "Cannot remove partial attachment");
    }
}
