//! Mailbox session primitives
//!
//! [`MailSession`] is the set of commands the monitor drives. The IMAP
//! implementation keeps the protocol turn-taking explicit: while an
//! IDLE is outstanding the session is held by the IDLE handle and no
//! other command can be issued until [`MailSession::idle_done`].

use crate::config::ImapConfig;
use crate::connection::{self, ImapSession, ImapStream, imap_error};
use crate::error::{Error, Result};
use async_imap::extensions::idle::{Handle, IdleResponse};
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What ended one wait for push data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// The mailbox now holds this many messages.
    Exists(u32),
    /// Some other untagged response (flags, expunge, keepalive).
    Update(String),
    /// The refresh deadline passed.
    Timeout,
    /// Shutdown was requested.
    Interrupted,
}

/// Commands the monitor issues against one authenticated session.
#[async_trait]
pub trait MailSession: Send {
    /// Whether the server advertised the IDLE extension.
    fn supports_idle(&self) -> bool;

    async fn select(&mut self, mailbox: &str) -> Result<()>;

    /// UIDs of unseen messages, ascending.
    async fn search_unseen(&mut self) -> Result<Vec<u32>>;

    /// Full raw message, without setting `\Seen`.
    async fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>>;

    async fn mark_seen(&mut self, uid: u32) -> Result<()>;

    /// Drain notifications received outside IDLE; true if any of them
    /// announced new messages.
    fn take_pending_push(&mut self) -> bool;

    /// Send IDLE and wait for the continuation.
    async fn idle_start(&mut self) -> Result<()>;

    /// Block until push data arrives, `deadline` passes or `cancel`
    /// fires. The IDLE stays outstanding in every case.
    async fn idle_wait(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<IdleEvent>;

    /// Send DONE and wait for the tagged completion of the IDLE.
    async fn idle_done(&mut self) -> Result<()>;

    async fn logout(&mut self) -> Result<()>;
}

/// Opens new sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: MailSession + 'static;

    /// Connect and authenticate.
    async fn connect(&self) -> Result<Self::Session>;
}

/// Connector for a real IMAP server.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    #[must_use]
    pub const fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    type Session = ImapMailSession;

    async fn connect(&self) -> Result<ImapMailSession> {
        let mut session = connection::connect(&self.config).await?;
        let push_capable = connection::supports_idle(&mut session).await?;
        if !push_capable {
            info!("Server does not advertise IDLE, polling only");
        }
        Ok(ImapMailSession {
            state: State::Ready(session),
            push_capable,
        })
    }
}

enum State {
    Ready(ImapSession),
    Idling(Handle<ImapStream>),
    Closed,
}

/// [`MailSession`] over an async-imap session.
pub struct ImapMailSession {
    state: State,
    push_capable: bool,
}

impl ImapMailSession {
    fn ready(&mut self) -> Result<&mut ImapSession> {
        match &mut self.state {
            State::Ready(session) => Ok(session),
            State::Idling(_) => Err(Error::Protocol("command issued while IDLE is outstanding".into())),
            State::Closed => Err(Error::Transport("session is closed".into())),
        }
    }
}

fn classify(response: &Response<'_>) -> IdleEvent {
    match response {
        Response::MailboxData(MailboxDatum::Exists(n)) => IdleEvent::Exists(*n),
        other => IdleEvent::Update(format!("{other:?}")),
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    fn supports_idle(&self) -> bool {
        self.push_capable
    }

    async fn select(&mut self, mailbox: &str) -> Result<()> {
        let exists = connection::select(self.ready()?, mailbox).await?;
        debug!(mailbox, exists, "Selected mailbox");
        Ok(())
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>> {
        let uids = self
            .ready()?
            .uid_search("UNSEEN")
            .await
            .map_err(imap_error("UID SEARCH failed"))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_message(&mut self, uid: u32) -> Result<Vec<u8>> {
        let session = self.ready()?;
        let mut stream = session
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .await
            .map_err(imap_error("UID FETCH failed"))?;

        let mut body = None;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(imap_error("UID FETCH failed"))?;
            if body.is_none() {
                body = fetch.body().map(<[u8]>::to_vec);
            }
        }
        drop(stream);

        body.ok_or(Error::MessageNotFound(uid))
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<()> {
        let session = self.ready()?;
        let updates: Vec<_> = session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(imap_error("UID STORE failed"))?
            .try_collect()
            .await
            .map_err(imap_error("UID STORE failed"))?;
        debug!(uid, updates = updates.len(), "Marked message seen");
        Ok(())
    }

    fn take_pending_push(&mut self) -> bool {
        let State::Ready(session) = &mut self.state else {
            return false;
        };
        let mut new_data = false;
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            if let UnsolicitedResponse::Exists(n) = response {
                debug!(exists = n, "Pending EXISTS received outside IDLE");
                new_data = true;
            }
        }
        new_data
    }

    async fn idle_start(&mut self) -> Result<()> {
        let session = match std::mem::replace(&mut self.state, State::Closed) {
            State::Ready(session) => session,
            other => {
                self.state = other;
                return Err(Error::Protocol("IDLE requires a ready session".into()));
            }
        };

        let mut handle = session.idle();
        handle.init().await.map_err(imap_error("IDLE rejected"))?;
        self.state = State::Idling(handle);
        Ok(())
    }

    async fn idle_wait(
        &mut self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<IdleEvent> {
        let State::Idling(handle) = &mut self.state else {
            return Err(Error::Protocol("no IDLE outstanding".into()));
        };

        let (wait, stop) = handle.wait();
        let mut stop = Some(stop);
        let mut reason = IdleEvent::Interrupted;
        tokio::pin!(wait);

        loop {
            tokio::select! {
                response = &mut wait => {
                    return match response.map_err(imap_error("IDLE wait failed"))? {
                        IdleResponse::NewData(data) => Ok(classify(data.parsed())),
                        IdleResponse::Timeout => Ok(IdleEvent::Timeout),
                        IdleResponse::ManualInterrupt => Ok(reason),
                    };
                }
                () = tokio::time::sleep_until(deadline), if stop.is_some() => {
                    reason = IdleEvent::Timeout;
                    stop = None;
                }
                () = cancel.cancelled(), if stop.is_some() => {
                    reason = IdleEvent::Interrupted;
                    stop = None;
                }
            }
        }
    }

    async fn idle_done(&mut self) -> Result<()> {
        let handle = match std::mem::replace(&mut self.state, State::Closed) {
            State::Idling(handle) => handle,
            other => {
                self.state = other;
                return Err(Error::Protocol("no IDLE to terminate".into()));
            }
        };

        let session = handle.done().await.map_err(imap_error("IDLE termination failed"))?;
        self.state = State::Ready(session);
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Ready(mut session) => session
                .logout()
                .await
                .map_err(imap_error("LOGOUT failed")),
            State::Idling(handle) => {
                let mut session = handle
                    .done()
                    .await
                    .map_err(imap_error("IDLE termination failed"))?;
                session.logout().await.map_err(imap_error("LOGOUT failed"))
            }
            State::Closed => Ok(()),
        }
    }
}
