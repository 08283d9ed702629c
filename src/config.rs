//! Watcher configuration
//!
//! Everything the monitor and the processing pipeline need is carried
//! in an explicit [`WatcherConfig`] handed to them at construction.
//! Values come from environment variables (and a `.env` file, if
//! present); [`WatcherConfig::from_lookup`] takes any key lookup so
//! the parsing rules can be exercised without touching the process
//! environment.

use crate::backoff::ReconnectPolicy;
use crate::error::{Error, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the transport is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// TLS from the first byte (IMAPS, usually port 993).
    Tls,
    /// Plain TCP upgraded with `STARTTLS` (e.g. Proton Bridge on 1143).
    StartTls,
}

impl FromStr for Security {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls" | "ssl" | "imaps" => Ok(Self::Tls),
            "starttls" => Ok(Self::StartTls),
            other => Err(Error::Config(format!(
                "Invalid IMAP_SECURITY '{other}' (expected tls or starttls)"
            ))),
        }
    }
}

/// IMAP connection configuration
#[derive(Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub security: Security,
    /// Skip certificate verification. Only meant for local bridges
    /// with self-signed certificates.
    pub accept_invalid_certs: bool,
    /// Mailbox to watch.
    pub mailbox: String,
}

impl ImapConfig {
    /// Load IMAP configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `IMAP_USERNAME` (or `GMAIL_ADDRESS`)
    /// - `IMAP_PASSWORD` (or `GMAIL_PASSWORD`)
    ///
    /// Optional (with defaults):
    /// - `IMAP_HOST` (default: `imap.gmail.com`)
    /// - `IMAP_PORT` (default: `993`)
    /// - `IMAP_SECURITY` (default: `tls`)
    /// - `IMAP_ACCEPT_INVALID_CERTS` (default: `false`)
    /// - `IMAP_MAILBOX` (default: `INBOX`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let config = Self {
            host: vars.string("IMAP_HOST", "imap.gmail.com"),
            port: vars.parse("IMAP_PORT", 993)?,
            username: vars.required(&["IMAP_USERNAME", "GMAIL_ADDRESS"])?,
            password: vars.required(&["IMAP_PASSWORD", "GMAIL_PASSWORD"])?,
            security: vars.parse("IMAP_SECURITY", Security::Tls)?,
            accept_invalid_certs: vars.flag("IMAP_ACCEPT_INVALID_CERTS", false)?,
            mailbox: vars.string("IMAP_MAILBOX", "INBOX"),
        };

        if config.port == 0 {
            return Err(Error::Config("IMAP_PORT must be non-zero".into()));
        }
        if config.host.is_empty() {
            return Err(Error::Config("IMAP_HOST cannot be empty".into()));
        }
        Ok(config)
    }
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security", &self.security)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

/// Document analysis settings.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub enabled: bool,
    /// Lower-cased extensions (without the dot) that get analysed.
    pub extensions: Vec<String>,
    /// External text extractor, e.g. `pdftotext {path} -`.
    pub extract_command: Option<String>,
    /// External describer; receives the extracted text on stdin.
    pub describe_command: Option<String>,
    /// Upper bound on each extraction and description run.
    pub timeout: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extensions: vec!["pdf".to_string()],
            extract_command: None,
            describe_command: None,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Full configuration of the watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub imap: ImapConfig,
    pub attachments_dir: PathBuf,
    /// Append-only JSON-lines log with one record per saved attachment.
    pub metadata_log: PathBuf,
    pub analysis: AnalysisConfig,
    /// Sleep between POLLING cycles.
    pub poll_interval: Duration,
    /// IDLE is re-issued after this long without a notification.
    pub idle_refresh: Duration,
    /// Upper bound on every regular command and on the IDLE
    /// termination acknowledgment.
    pub command_timeout: Duration,
    /// Upper bound on the best-effort logout at shutdown.
    pub logout_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Attachments larger than this many bytes are skipped.
    pub max_attachment_size: u64,
    /// Leave a message unseen when one of its attachments could not
    /// be written, so the next catch-up retries it.
    pub retry_failed_storage: bool,
}

impl WatcherConfig {
    /// Defaults for everything but the connection settings.
    #[must_use]
    pub fn new(imap: ImapConfig) -> Self {
        Self {
            imap,
            attachments_dir: PathBuf::from("data/attachments"),
            metadata_log: PathBuf::from("data/logs/attachments.json"),
            analysis: AnalysisConfig::default(),
            poll_interval: Duration::from_secs(10),
            idle_refresh: Duration::from_secs(29 * 60),
            command_timeout: Duration::from_secs(60),
            logout_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            max_attachment_size: 50 * 1024 * 1024,
            retry_failed_storage: false,
        }
    }

    /// Load the full watcher configuration from the environment.
    ///
    /// See [`ImapConfig::from_env`] for the connection variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let imap = ImapConfig::from_lookup(&lookup)?;
        let vars = Vars(lookup);
        let defaults = Self::new(imap);

        let log_dir = PathBuf::from(vars.string("LOG_DIR", "data/logs"));
        let extensions = vars
            .string("ANALYSIS_EXTENSIONS", "pdf")
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        let enabled = match vars.get("ENABLE_ANALYSIS") {
            Some(_) => vars.flag("ENABLE_ANALYSIS", true)?,
            None => vars.flag("ENABLE_SUMMARIZATION", true)?,
        };
        let max_attachment_size = vars
            .parse::<u64>("MAX_ATTACHMENT_SIZE", 50)?
            .checked_mul(1024 * 1024)
            .ok_or_else(|| Error::Config("MAX_ATTACHMENT_SIZE is too large".into()))?;

        let config = Self {
            attachments_dir: PathBuf::from(vars.string("ATTACHMENTS_DIR", "data/attachments")),
            metadata_log: log_dir.join("attachments.json"),
            analysis: AnalysisConfig {
                enabled,
                extensions,
                extract_command: vars.get("TEXT_EXTRACT_COMMAND"),
                describe_command: vars.get("DESCRIBE_COMMAND"),
                timeout: vars.secs("ANALYSIS_TIMEOUT", defaults.analysis.timeout)?,
            },
            poll_interval: vars.secs("POLL_INTERVAL", defaults.poll_interval)?,
            idle_refresh: vars.secs("IDLE_REFRESH", defaults.idle_refresh)?,
            command_timeout: vars.secs("COMMAND_TIMEOUT", defaults.command_timeout)?,
            logout_timeout: vars.secs("LOGOUT_TIMEOUT", defaults.logout_timeout)?,
            reconnect: ReconnectPolicy {
                initial_delay: vars.secs("RECONNECT_DELAY", defaults.reconnect.initial_delay)?,
                max_delay: vars.secs("RECONNECT_MAX_DELAY", defaults.reconnect.max_delay)?,
                warn_after: vars.parse("MAX_RECONNECT_ATTEMPTS", defaults.reconnect.warn_after)?,
            },
            max_attachment_size,
            retry_failed_storage: vars.flag("RETRY_FAILED_STORAGE", false)?,
            imap: defaults.imap,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("POLL_INTERVAL must be greater than 0".into()));
        }
        if self.idle_refresh.is_zero() {
            return Err(Error::Config("IDLE_REFRESH must be greater than 0".into()));
        }
        if self.command_timeout.is_zero() {
            return Err(Error::Config("COMMAND_TIMEOUT must be greater than 0".into()));
        }
        if self.analysis.timeout.is_zero() {
            return Err(Error::Config("ANALYSIS_TIMEOUT must be greater than 0".into()));
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(Error::Config(
                "RECONNECT_DELAY cannot exceed RECONNECT_MAX_DELAY".into(),
            ));
        }
        if self.attachments_dir.as_os_str().is_empty() {
            return Err(Error::Config("ATTACHMENTS_DIR cannot be empty".into()));
        }
        Ok(())
    }
}

/// Typed access to a key lookup.
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, keys: &[&str]) -> Result<String> {
        keys.iter()
            .find_map(|key| self.get(key))
            .ok_or_else(|| Error::Config(format!("{} not set", keys.join(" or "))))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key).map_or(Ok(default), |raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid {key}: {e}")))
        })
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::Config(format!("Invalid {key}: '{other}' is not a boolean"))),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}
