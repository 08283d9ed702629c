//! Per-message processing: store every qualifying attachment, then
//! hand supported documents to the analyzer.

use crate::analysis::Analyzer;
use crate::config::WatcherConfig;
use crate::error::Result;
use crate::parser::EmailMessage;
use crate::sanitize::TIMESTAMP_FORMAT;
use crate::store::{AttachmentRecord, AttachmentStore};

/// Outcome of processing one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingResult {
    /// Parts that qualified as attachments.
    pub attachments_found: usize,
    pub saved: Vec<AttachmentRecord>,
    /// Attachments whose write failed.
    pub storage_failures: usize,
    /// Attachments skipped for exceeding the size limit.
    pub skipped: usize,
    /// Summary artifacts written.
    pub analyzed: usize,
}

impl ProcessingResult {
    /// Every qualifying attachment is durably stored (or was skipped
    /// on purpose).
    #[must_use]
    pub const fn fully_stored(&self) -> bool {
        self.storage_failures == 0
    }
}

pub struct ProcessingPipeline {
    store: AttachmentStore,
    analyzer: Option<Analyzer>,
    max_attachment_size: u64,
}

impl ProcessingPipeline {
    #[must_use]
    pub const fn new(
        store: AttachmentStore,
        analyzer: Option<Analyzer>,
        max_attachment_size: u64,
    ) -> Self {
        Self {
            store,
            analyzer,
            max_attachment_size,
        }
    }

    /// Build the pipeline described by the watcher configuration.
    pub fn from_config(config: &WatcherConfig) -> Result<Self> {
        let store = AttachmentStore::new(&config.attachments_dir, &config.metadata_log);
        let analyzer = Analyzer::from_config(&config.analysis)?;
        Ok(Self::new(store, analyzer, config.max_attachment_size))
    }

    #[must_use]
    pub const fn store(&self) -> &AttachmentStore {
        &self.store
    }

    /// Process a message using the current local time as the filename
    /// timestamp.
    pub async fn process(&self, message: &EmailMessage) -> ProcessingResult {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        self.process_at(message, &timestamp).await
    }

    /// Process a message with an explicit filename timestamp.
    ///
    /// Storage failures are counted and logged but never stop the
    /// remaining attachments. Analysis failures are only logged.
    pub async fn process_at(&self, message: &EmailMessage, timestamp: &str) -> ProcessingResult {
        let mut result = ProcessingResult::default();
        tracing::info!(sender = %message.sender, subject = %message.subject, "Processing email");

        for part in message.attachments() {
            result.attachments_found += 1;
            let filename = part.filename.as_deref().unwrap_or_default();
            let size = part.payload.len() as u64;

            if size > self.max_attachment_size {
                tracing::warn!(
                    filename,
                    size,
                    limit = self.max_attachment_size,
                    "Skipping oversized attachment"
                );
                result.skipped += 1;
                continue;
            }

            let saved = self
                .store
                .save(
                    &part.payload,
                    filename,
                    &message.sender,
                    &message.subject,
                    timestamp,
                )
                .await;
            let record = match saved {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(filename, error = %e, "Failed to save attachment");
                    result.storage_failures += 1;
                    continue;
                }
            };

            if let Some(analyzer) = &self.analyzer
                && analyzer.supports(&record.file_path)
            {
                match analyzer.analyze(&record).await {
                    Ok(Some(_)) => result.analyzed += 1,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(file = %record.saved_filename, error = %e, "Document analysis failed");
                    }
                }
            }
            result.saved.push(record);
        }

        if result.attachments_found == 0 {
            if message.declares_attachments() {
                tracing::warn!(
                    sender = %message.sender,
                    "Attachment parts without filename or content were ignored"
                );
            } else {
                tracing::info!("No attachments found in email");
            }
        }
        result
    }
}
