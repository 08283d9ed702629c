#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for watching an IMAP inbox and saving attachments

use attachment_watcher::shutdown::spawn_signal_listener;
use attachment_watcher::{
    AttachmentRecord, AttachmentStore, Connector, IdleMonitor, ImapConnector, MailSession,
    ProcessingPipeline, WatcherConfig,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "attachment-watcher")]
#[command(about = "Watch an IMAP inbox and save incoming attachments")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Override ATTACHMENTS_DIR
    #[arg(long, global = true)]
    attachments_dir: Option<PathBuf>,

    /// Disable document analysis
    #[arg(long, global = true)]
    no_analysis: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Watch the inbox until interrupted (default)
    Watch,

    /// Test the connection and report mailbox status
    Check,

    /// Process unseen messages once and exit
    Scan,

    /// Show the saved attachment records
    Records,
}

#[derive(Serialize)]
struct CheckReport {
    host: String,
    mailbox: String,
    idle: bool,
    unseen: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = WatcherConfig::from_env()?;
    if let Some(dir) = &args.attachments_dir {
        config.attachments_dir.clone_from(dir);
    }
    if args.no_analysis {
        config.analysis.enabled = false;
    }

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => cmd_watch(config).await,
        Command::Check => cmd_check(&config, &args).await,
        Command::Scan => cmd_scan(config).await,
        Command::Records => cmd_records(&config, &args),
    }
}

async fn cmd_watch(config: WatcherConfig) -> anyhow::Result<()> {
    info!(
        host = %config.imap.host,
        mailbox = %config.imap.mailbox,
        attachments_dir = %config.attachments_dir.display(),
        analysis = config.analysis.enabled,
        "Attachment watcher starting"
    );

    let cancel = CancellationToken::new();
    let signals = spawn_signal_listener(cancel.clone());

    let pipeline = ProcessingPipeline::from_config(&config)?;
    let connector = ImapConnector::new(config.imap.clone());
    let stats = IdleMonitor::new(connector, pipeline, config, cancel.clone())
        .run()
        .await;

    cancel.cancel();
    signals.await?;
    info!(
        messages = stats.messages_processed,
        attachments = stats.attachments_saved,
        "Attachment watcher stopped"
    );
    Ok(())
}

async fn cmd_check(config: &WatcherConfig, args: &Args) -> anyhow::Result<()> {
    let mut session = ImapConnector::new(config.imap.clone()).connect().await?;
    session.select(&config.imap.mailbox).await?;
    let unseen = session.search_unseen().await?.len();
    let report = CheckReport {
        host: config.imap.host.clone(),
        mailbox: config.imap.mailbox.clone(),
        idle: session.supports_idle(),
        unseen,
    };
    session.logout().await.ok();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Connected to {} as {}", report.host, config.imap.username);
        println!("Mailbox:  {}", report.mailbox);
        println!("IDLE:     {}", if report.idle { "supported" } else { "not supported, polling" });
        println!("Unseen:   {}", report.unseen);
    }
    Ok(())
}

async fn cmd_scan(config: WatcherConfig) -> anyhow::Result<()> {
    let pipeline = ProcessingPipeline::from_config(&config)?;
    let connector = ImapConnector::new(config.imap.clone());
    let stats = IdleMonitor::new(connector, pipeline, config, CancellationToken::new())
        .scan()
        .await?;
    println!(
        "Processed {} message(s), saved {} attachment(s)",
        stats.messages_processed, stats.attachments_saved
    );
    Ok(())
}

fn cmd_records(config: &WatcherConfig, args: &Args) -> anyhow::Result<()> {
    let store = AttachmentStore::new(&config.attachments_dir, &config.metadata_log);
    let records = store.read_records()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_record_table(&records);
    }
    Ok(())
}

fn print_record_table(records: &[AttachmentRecord]) {
    if records.is_empty() {
        println!("No attachments recorded.");
        return;
    }

    println!("{:<26} {:<30} {:<36} {:>10}", "Saved", "From", "File", "Bytes");
    println!("{}", "-".repeat(105));

    for record in records {
        println!(
            "{:<26} {:<30} {:<36} {:>10}",
            truncate(&record.timestamp, 25),
            truncate(&record.sender, 28),
            truncate(&record.original_filename, 34),
            record.file_size,
        );
    }

    println!("\n{} attachment(s)", records.len());
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
