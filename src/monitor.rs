//! Inbox monitor
//!
//! [`IdleMonitor`] owns the single mailbox session and drives it
//! through the connection lifecycle:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CATCHUP -> IDLE_HANDSHAKE -> IDLE_WAITING
//!      ^              |           ^  |                           |
//!      |              v           |  v                           v
//!      +----------- (fail)        | POLLING               IDLE_TERMINATING
//!                                 +----- new data ---------------+
//! ```
//!
//! Every transition runs on one task, so at most one IMAP command is in
//! flight. Shutdown arrives through a [`CancellationToken`] that every
//! blocking wait selects against; an outstanding IDLE is always
//! terminated with DONE before logging out.

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::parser::parse_message;
use crate::pipeline::ProcessingPipeline;
use crate::session::{Connector, IdleEvent, MailSession};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Externally visible monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Catchup,
    IdleHandshake,
    IdleWaiting,
    IdleTerminating,
    Polling,
    ShuttingDown,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Catchup => "CATCHUP",
            Self::IdleHandshake => "IDLE_HANDSHAKE",
            Self::IdleWaiting => "IDLE_WAITING",
            Self::IdleTerminating => "IDLE_TERMINATING",
            Self::Polling => "POLLING",
            Self::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}

/// Why an outstanding IDLE is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    NewData,
    Refresh,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected { retry: bool },
    Connecting,
    Catchup,
    IdleHandshake,
    IdleWaiting { deadline: Instant },
    IdleTerminating(TerminateReason),
    Polling,
    ShuttingDown,
}

impl Phase {
    const fn state(self) -> MonitorState {
        match self {
            Self::Disconnected { .. } => MonitorState::Disconnected,
            Self::Connecting => MonitorState::Connecting,
            Self::Catchup => MonitorState::Catchup,
            Self::IdleHandshake => MonitorState::IdleHandshake,
            Self::IdleWaiting { .. } => MonitorState::IdleWaiting,
            Self::IdleTerminating(_) => MonitorState::IdleTerminating,
            Self::Polling => MonitorState::Polling,
            Self::ShuttingDown => MonitorState::ShuttingDown,
        }
    }

    /// Phases that must finish their protocol exchange before
    /// honouring a shutdown request.
    const fn owns_idle(self) -> bool {
        matches!(self, Self::IdleWaiting { .. } | Self::IdleTerminating(_))
    }
}

/// Counters reported when the monitor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub connections: u64,
    pub connect_failures: u64,
    pub session_failures: u64,
    pub catchups: u64,
    pub notifications: u64,
    pub idle_refreshes: u64,
    pub messages_processed: u64,
    pub attachments_saved: u64,
}

/// Run `fut` with an upper bound, mapping expiry to [`Error::Timeout`].
async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit, what))?
}

pub struct IdleMonitor<C: Connector> {
    connector: C,
    pipeline: ProcessingPipeline,
    config: WatcherConfig,
    cancel: CancellationToken,
    state: watch::Sender<MonitorState>,
    session: Option<C::Session>,
    failures: u32,
    fallback_pending: bool,
    stats: MonitorStats,
}

impl<C: Connector> IdleMonitor<C> {
    pub fn new(
        connector: C,
        pipeline: ProcessingPipeline,
        config: WatcherConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Disconnected);
        Self {
            connector,
            pipeline,
            config,
            cancel,
            state,
            session: None,
            failures: 0,
            fallback_pending: false,
            stats: MonitorStats::default(),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    /// Run until the cancellation token fires.
    pub async fn run(mut self) -> MonitorStats {
        info!(mailbox = %self.config.imap.mailbox, "Starting inbox monitor");
        let mut phase = Phase::Disconnected { retry: false };

        loop {
            if self.cancel.is_cancelled() && !phase.owns_idle() {
                phase = Phase::ShuttingDown;
            }
            self.publish(phase);

            phase = match phase {
                Phase::Disconnected { retry } => self.disconnected(retry).await,
                Phase::Connecting => self.connecting().await,
                Phase::Catchup => self.catchup().await,
                Phase::IdleHandshake => self.idle_handshake().await,
                Phase::IdleWaiting { deadline } => self.idle_waiting(deadline).await,
                Phase::IdleTerminating(reason) => self.idle_terminating(reason).await,
                Phase::Polling => self.polling().await,
                Phase::ShuttingDown => {
                    self.shutting_down().await;
                    break;
                }
            };
        }

        info!(stats = ?self.stats, "Inbox monitor stopped");
        self.stats
    }

    /// Connect, process every unseen message once, and log out.
    pub async fn scan(mut self) -> Result<MonitorStats> {
        let mut session = bounded(
            self.config.command_timeout,
            "connect",
            self.connector.connect(),
        )
        .await?;
        bounded(
            self.config.command_timeout,
            "SELECT",
            session.select(&self.config.imap.mailbox),
        )
        .await?;
        self.stats.connections += 1;
        self.session = Some(session);

        self.sweep().await?;
        self.shutting_down().await;
        Ok(self.stats)
    }

    fn publish(&self, phase: Phase) {
        let state = phase.state();
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "State transition");
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    fn session(&mut self) -> Result<&mut C::Session> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Transport("no active session".into()))
    }

    /// Tear the session down after a session-level failure.
    fn fail(&mut self, error: &Error) -> Phase {
        error!(error = %error, "Session failed, reconnecting");
        self.stats.session_failures += 1;
        self.session = None;
        self.fallback_pending = true;
        Phase::Disconnected { retry: true }
    }

    async fn disconnected(&mut self, retry: bool) -> Phase {
        self.session = None;
        if retry {
            let delay = self.config.reconnect.delay(self.failures.max(1));
            info!(delay_secs = delay.as_secs(), "Waiting before reconnecting");
            if !self.sleep(delay).await {
                return Phase::ShuttingDown;
            }
        }
        Phase::Connecting
    }

    async fn connecting(&mut self) -> Phase {
        let limit = self.config.command_timeout;
        let attempt = async {
            let mut session = bounded(limit, "connect", self.connector.connect()).await?;
            bounded(limit, "SELECT", session.select(&self.config.imap.mailbox)).await?;
            Ok::<_, Error>(session)
        };

        let result = tokio::select! {
            result = attempt => result,
            () = self.cancel.cancelled() => return Phase::ShuttingDown,
        };

        match result {
            Ok(session) => {
                info!(
                    mailbox = %self.config.imap.mailbox,
                    push = session.supports_idle(),
                    "Session established"
                );
                self.failures = 0;
                self.stats.connections += 1;
                self.session = Some(session);
                if self.fallback_pending {
                    info!("Running one polling cycle before retrying IDLE");
                    Phase::Polling
                } else {
                    Phase::Catchup
                }
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                self.stats.connect_failures += 1;
                if self.config.reconnect.exhausted(self.failures) {
                    error!(
                        attempt = self.failures,
                        error = %e,
                        "Connection keeps failing, still retrying"
                    );
                } else {
                    warn!(attempt = self.failures, error = %e, "Connection failed");
                }
                Phase::Disconnected { retry: true }
            }
        }
    }

    async fn catchup(&mut self) -> Phase {
        loop {
            self.stats.catchups += 1;
            if let Err(e) = self.sweep().await {
                return self.fail(&e);
            }
            if self.cancel.is_cancelled() {
                return Phase::ShuttingDown;
            }
            let pending = match self.session() {
                Ok(session) => session.take_pending_push(),
                Err(e) => return self.fail(&e),
            };
            if !pending {
                break;
            }
            debug!("New mail arrived during catch-up, sweeping again");
        }

        match self.session() {
            Ok(session) if session.supports_idle() => Phase::IdleHandshake,
            Ok(_) => Phase::Polling,
            Err(e) => self.fail(&e),
        }
    }

    async fn idle_handshake(&mut self) -> Phase {
        let limit = self.config.command_timeout;
        let started = match self.session() {
            Ok(session) => bounded(limit, "IDLE handshake", session.idle_start()).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(()) => {
                info!("Waiting for new mail (IDLE)");
                Phase::IdleWaiting {
                    deadline: Instant::now() + self.config.idle_refresh,
                }
            }
            Err(e) => self.fail(&e),
        }
    }

    async fn idle_waiting(&mut self, deadline: Instant) -> Phase {
        let cancel = self.cancel.clone();
        let event = match self.session() {
            Ok(session) => session.idle_wait(deadline, &cancel).await,
            Err(e) => Err(e),
        };

        match event {
            Ok(IdleEvent::Exists(count)) => {
                info!(exists = count, "New mail notification");
                self.stats.notifications += 1;
                Phase::IdleTerminating(TerminateReason::NewData)
            }
            Ok(IdleEvent::Update(line)) => {
                debug!(response = %line, "Ignoring IDLE update");
                Phase::IdleWaiting { deadline }
            }
            Ok(IdleEvent::Timeout) => {
                debug!("IDLE refresh due");
                self.stats.idle_refreshes += 1;
                Phase::IdleTerminating(TerminateReason::Refresh)
            }
            Ok(IdleEvent::Interrupted) => Phase::IdleTerminating(TerminateReason::Shutdown),
            Err(e) => self.fail(&e),
        }
    }

    async fn idle_terminating(&mut self, reason: TerminateReason) -> Phase {
        let limit = self.config.command_timeout;
        let done = match self.session() {
            Ok(session) => bounded(limit, "IDLE termination", session.idle_done()).await,
            Err(e) => Err(e),
        };

        match (done, reason) {
            (Ok(()), TerminateReason::NewData) => Phase::Catchup,
            (Ok(()), TerminateReason::Refresh) => Phase::IdleHandshake,
            (Ok(()), TerminateReason::Shutdown) => Phase::ShuttingDown,
            (Err(e), TerminateReason::Shutdown) => {
                warn!(error = %e, "IDLE termination failed during shutdown");
                self.session = None;
                Phase::ShuttingDown
            }
            (Err(e), _) => self.fail(&e),
        }
    }

    async fn polling(&mut self) -> Phase {
        let limit = self.config.command_timeout;
        let mailbox = self.config.imap.mailbox.clone();
        let selected = match self.session() {
            Ok(session) => bounded(limit, "SELECT", session.select(&mailbox)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = selected {
            return self.fail(&e);
        }
        if let Err(e) = self.sweep().await {
            return self.fail(&e);
        }

        if !self.sleep(self.config.poll_interval).await {
            return Phase::ShuttingDown;
        }

        let push_capable = self.session.as_ref().is_some_and(MailSession::supports_idle);
        if !push_capable {
            return Phase::Polling;
        }

        info!("Reconnecting to retry IDLE");
        self.fallback_pending = false;
        if let Some(mut session) = self.session.take()
            && let Err(e) = bounded(limit, "LOGOUT", session.logout()).await
        {
            debug!(error = %e, "Logout before reconnect failed");
        }
        Phase::Disconnected { retry: false }
    }

    async fn shutting_down(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match bounded(self.config.logout_timeout, "LOGOUT", session.logout()).await {
            Ok(()) => info!("Logged out"),
            Err(e) => warn!(error = %e, "Logout failed"),
        }
    }

    /// Process every unseen message once.
    ///
    /// Session-level errors abort the sweep; anything confined to one
    /// message is logged and the sweep moves on. Cancellation abandons
    /// the message in progress without marking it seen.
    async fn sweep(&mut self) -> Result<()> {
        let limit = self.config.command_timeout;
        let retry_failed_storage = self.config.retry_failed_storage;
        let Some(session) = self.session.as_mut() else {
            return Err(Error::Transport("no active session".into()));
        };

        let uids = bounded(limit, "UID SEARCH", session.search_unseen()).await?;
        if uids.is_empty() {
            debug!("No unseen messages");
            return Ok(());
        }
        info!(count = uids.len(), "Processing unseen messages");

        for uid in uids {
            if self.cancel.is_cancelled() {
                break;
            }

            let raw = match bounded(limit, "UID FETCH", session.fetch_message(uid)).await {
                Ok(raw) => raw,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => {
                    warn!(uid, error = %e, "Skipping message, left unseen");
                    continue;
                }
            };

            let mark_seen = match parse_message(&raw) {
                Ok(message) => {
                    let processed = tokio::select! {
                        result = self.pipeline.process(&message) => Some(result),
                        () = self.cancel.cancelled() => None,
                    };
                    let Some(result) = processed else {
                        info!(uid, "Shutdown requested mid-message, leaving it unseen");
                        break;
                    };
                    self.stats.attachments_saved += result.saved.len() as u64;
                    if result.fully_stored() || !retry_failed_storage {
                        true
                    } else {
                        warn!(
                            uid,
                            failures = result.storage_failures,
                            "Attachment storage failed, leaving message unseen for retry"
                        );
                        false
                    }
                }
                Err(e) => {
                    error!(uid, error = %e, "Unparseable message, marking seen");
                    true
                }
            };

            if mark_seen {
                bounded(limit, "UID STORE", session.mark_seen(uid)).await?;
            }
            self.stats.messages_processed += 1;
        }
        Ok(())
    }
}
