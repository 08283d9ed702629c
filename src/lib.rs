//! IMAP attachment watcher
//!
//! Keeps one authenticated IMAP session open, waits for new mail with
//! IDLE (falling back to polling), stores every attachment of unseen
//! messages under a sanitized name with a JSON-lines metadata record,
//! and optionally hands stored documents to external text extraction
//! and description programs.
//!
//! The entry point is [`IdleMonitor`], driven by a [`Connector`] (the
//! real one is [`ImapConnector`]) and a [`ProcessingPipeline`].

pub mod analysis;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod pipeline;
pub mod sanitize;
pub mod session;
pub mod shutdown;
pub mod store;

pub use analysis::{Analyzer, Describer, TextExtractor};
pub use backoff::ReconnectPolicy;
pub use config::{AnalysisConfig, ImapConfig, Security, WatcherConfig};
pub use error::{Error, Result};
pub use monitor::{IdleMonitor, MonitorState, MonitorStats};
pub use parser::{AttachmentPart, EmailMessage, parse_message};
pub use pipeline::{ProcessingPipeline, ProcessingResult};
pub use sanitize::sanitize_filename;
pub use session::{Connector, IdleEvent, ImapConnector, ImapMailSession, MailSession};
pub use store::{AttachmentRecord, AttachmentStore};
