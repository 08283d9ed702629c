//! Document analysis collaborators
//!
//! Text extraction and description generation are opaque to the
//! watcher. They sit behind [`TextExtractor`] and [`Describer`]; the
//! built-in implementations shell out to configured programs.

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::store::AttachmentRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Description returned when no describer is configured.
pub const UNAVAILABLE: &str = "Document analysis unavailable";

/// Number of characters of extracted text kept in the preview.
pub const PREVIEW_CHARS: usize = 1000;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract plain text from a stored document. May return an empty
    /// string when the document has no text layer.
    async fn extract_text(&self, path: &Path) -> Result<String>;
}

#[async_trait]
pub trait Describer: Send + Sync {
    async fn describe(&self, text: &str) -> Result<String>;
}

/// Runs an external program and reads the text from its stdout.
///
/// The command line is split on whitespace; a `{path}` argument is
/// replaced by the document path, otherwise the path is appended.
#[derive(Debug, Clone)]
pub struct CommandTextExtractor {
    program: String,
    args: Vec<String>,
}

impl CommandTextExtractor {
    pub fn new(command_line: &str) -> Result<Self> {
        let (program, args) = split_command(command_line)?;
        Ok(Self { program, args })
    }
}

#[async_trait]
impl TextExtractor for CommandTextExtractor {
    async fn extract_text(&self, path: &Path) -> Result<String> {
        let path_arg = path.to_string_lossy();
        let mut substituted = false;
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{path}") {
                    substituted = true;
                    arg.replace("{path}", &path_arg)
                } else {
                    arg.clone()
                }
            })
            .collect();

        let mut command = Command::new(&self.program);
        command.args(&args);
        if !substituted {
            command.arg(path);
        }

        let output = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Analysis(format!("Cannot run {}: {e}", self.program)))?;
        if !output.status.success() {
            return Err(Error::Analysis(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Runs an external program, feeding the text on stdin and taking the
/// trimmed stdout as the description.
#[derive(Debug, Clone)]
pub struct CommandDescriber {
    program: String,
    args: Vec<String>,
}

impl CommandDescriber {
    pub fn new(command_line: &str) -> Result<Self> {
        let (program, args) = split_command(command_line)?;
        Ok(Self { program, args })
    }
}

#[async_trait]
impl Describer for CommandDescriber {
    async fn describe(&self, text: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Analysis(format!("Cannot run {}: {e}", self.program)))?;

        // stdout is drained while stdin is fed, so a describer that
        // echoes its input cannot fill the pipe and stall.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin
                && let Err(e) = stdin.write_all(text.as_bytes()).await
            {
                // A describer may stop reading early; that is not an error.
                tracing::debug!("Describer closed stdin early: {e}");
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());

        let output =
            output.map_err(|e| Error::Analysis(format!("{} failed: {e}", self.program)))?;
        if !output.status.success() {
            return Err(Error::Analysis(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let description = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if description.is_empty() {
            return Err(Error::Analysis(format!("{} produced no output", self.program)));
        }
        Ok(description)
    }
}

/// Describer used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableDescriber;

#[async_trait]
impl Describer for UnavailableDescriber {
    async fn describe(&self, _text: &str) -> Result<String> {
        Ok(UNAVAILABLE.to_string())
    }
}

fn split_command(command_line: &str) -> Result<(String, Vec<String>)> {
    let mut words = command_line.split_whitespace().map(str::to_string);
    let program = words
        .next()
        .ok_or_else(|| Error::Config("Empty analysis command".into()))?;
    Ok((program, words.collect()))
}

/// Extractor, describer and the document types they apply to.
#[derive(Clone)]
pub struct Analyzer {
    pub extractor: Arc<dyn TextExtractor>,
    pub describer: Arc<dyn Describer>,
    pub extensions: Vec<String>,
    /// Upper bound on each collaborator call. Command-backed
    /// collaborators are killed when it expires.
    pub timeout: Duration,
}

impl Analyzer {
    /// Build the analyzer described by `config`.
    ///
    /// Returns `None` when analysis is disabled or no extractor is
    /// configured, since there is nothing to describe without text.
    pub fn from_config(config: &AnalysisConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let Some(extract) = config.extract_command.as_deref() else {
            tracing::info!("No TEXT_EXTRACT_COMMAND configured, document analysis disabled");
            return Ok(None);
        };

        let describer: Arc<dyn Describer> = match config.describe_command.as_deref() {
            Some(cmd) => Arc::new(CommandDescriber::new(cmd)?),
            None => Arc::new(UnavailableDescriber),
        };

        Ok(Some(Self {
            extractor: Arc::new(CommandTextExtractor::new(extract)?),
            describer,
            extensions: config.extensions.clone(),
            timeout: config.timeout,
        }))
    }

    /// Whether the stored file at `path` is a supported document type.
    #[must_use]
    pub fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
    }

    /// Extract, describe and write the summary artifact for a stored
    /// attachment. Returns the artifact path, or `None` when the
    /// document yielded no text.
    ///
    /// Extraction failures are returned. A describer that fails or
    /// times out is replaced by [`UNAVAILABLE`] and the artifact is
    /// still written.
    pub async fn analyze(&self, record: &AttachmentRecord) -> Result<Option<PathBuf>> {
        tracing::info!(file = %record.saved_filename, "Analyzing document");

        let text = tokio::time::timeout(
            self.timeout,
            self.extractor.extract_text(&record.file_path),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout, "text extraction"))??;
        if text.trim().is_empty() {
            tracing::warn!(file = %record.saved_filename, "No text extracted from document");
            return Ok(None);
        }
        tracing::info!(
            file = %record.saved_filename,
            chars = text.chars().count(),
            "Extracted text for analysis"
        );

        let described = tokio::time::timeout(self.timeout, self.describer.describe(&text))
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(self.timeout, "document description")));
        let description = match described {
            Ok(description) => description,
            Err(e) => {
                tracing::warn!(file = %record.saved_filename, error = %e, "Description unavailable");
                UNAVAILABLE.to_string()
            }
        };
        let path = summary_path(&record.file_path);
        let contents = render_summary(record, &description, &text, chrono::Local::now());
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::Analysis(format!("Cannot write {}: {e}", path.display())))?;

        tracing::info!(summary = %path.display(), "Generated document analysis");
        Ok(Some(path))
    }
}

/// `{stem}_summary.txt` next to the stored file.
#[must_use]
pub fn summary_path(stored: &Path) -> PathBuf {
    let stem = stored
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
    stored.with_file_name(format!("{stem}_summary.txt"))
}

fn render_summary(
    record: &AttachmentRecord,
    description: &str,
    text: &str,
    processed: chrono::DateTime<chrono::Local>,
) -> String {
    let rule = "-".repeat(50);
    let total = text.chars().count();
    let preview: String = text.chars().take(PREVIEW_CHARS).collect();

    let mut out = format!(
        "Document Analysis for: {}\n\
         From: {}\n\
         Subject: {}\n\
         Processed: {}\n\
         File Size: {} bytes\n\
         {rule}\n\n\
         DOCUMENT DESCRIPTION:\n{description}\n\n\
         {rule}\n\
         CONTENT PREVIEW (first {PREVIEW_CHARS} characters):\n\
         {preview}",
        record.original_filename,
        record.sender,
        record.subject,
        processed.to_rfc3339(),
        record.file_size,
    );
    if total > PREVIEW_CHARS {
        out.push_str(&format!(
            "\n\n... (document continues for {total} total characters)"
        ));
    }
    out
}
