//! In-process fake IMAP server for integration testing
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   STARTTLS mode: greeting in clear, STARTTLS, TLS handshake
//!   implicit mode: TLS handshake, greeting over TLS
//!       |
//!   LOGIN, CAPABILITY, SELECT
//!       |
//!   UID SEARCH UNSEEN / UID FETCH / UID STORE +FLAGS (\Seen)
//!       |
//!   IDLE ... "* N EXISTS" ... DONE        (repeats)
//!       |
//!   LOGOUT
//! ```
//!
//! ## Push notifications
//!
//! While a client sits in IDLE the server may send untagged responses
//! at any time. [`FakeImapServer::deliver`] queues a message and wakes
//! the idling connection, which appends it to INBOX and announces the
//! new count with `* N EXISTS`. That is the only signal the watcher
//! needs to run a catch-up sweep.
//!
//! ## Literals
//!
//! Bodies travel as counted literals, `{bytecount}\r\n` followed by
//! exactly that many raw bytes, so binary attachments survive intact.

use super::handlers::{
    StoreArgs, handle_capability, handle_idle, handle_login, handle_logout, handle_select,
    handle_uid_fetch, handle_uid_search, handle_uid_store, is_idle_command,
};
use super::io::write_line;
use super::mailbox::{Mailbox, TestEmail};
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, watch};
use tokio_rustls::TlsAcceptor;

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    StartTls,
    ImplicitTls,
}

/// State shared between the test and every connection.
struct Shared {
    mailbox: Mutex<Mailbox>,
    arrivals: Notify,
    connections: AtomicUsize,
}

/// A fake IMAP server on `127.0.0.1` with an OS-assigned port.
///
/// A self-signed certificate for `127.0.0.1` is generated at startup,
/// so clients must skip certificate verification. Dropping the server
/// stops accepting and closes every open connection.
pub struct FakeImapServer {
    port: u16,
    shared: Arc<Shared>,
    kick: watch::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server that expects STARTTLS before anything else.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Transport::StartTls).await
    }

    /// Start a server that speaks TLS from the first byte (port 993
    /// style).
    pub async fn start_implicit_tls(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Transport::ImplicitTls).await
    }

    async fn spawn(mailbox: Mailbox, transport: Transport) -> Self {
        // Several tests may race to install the provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let shared = Arc::new(Shared {
            mailbox: Mutex::new(mailbox),
            arrivals: Notify::new(),
            connections: AtomicUsize::new(0),
        });
        let (kick, _) = watch::channel(());

        let handle = {
            let shared = shared.clone();
            let kick = kick.clone();
            tokio::spawn(async move {
                while let Ok((stream, _addr)) = listener.accept().await {
                    shared.connections.fetch_add(1, Ordering::SeqCst);
                    let acceptor = acceptor.clone();
                    let shared = shared.clone();
                    let mut kicked = kick.subscribe();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = handle_connection(stream, transport, acceptor, &shared) => {}
                            _ = kicked.changed() => {}
                        }
                    });
                }
            })
        };

        Self {
            port,
            shared,
            kick,
            handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// A copy of the current mailbox state.
    pub fn snapshot(&self) -> Mailbox {
        self.shared.mailbox.lock().unwrap().clone()
    }

    /// Deliver an unseen message to INBOX. An idling client is told
    /// right away. Otherwise the message shows up at the next IDLE or
    /// SELECT, whichever comes first.
    pub fn deliver(&self, uid: u32, raw: &[u8]) {
        self.shared.mailbox.lock().unwrap().arrivals.push_back(TestEmail {
            uid,
            seen: false,
            raw: raw.to_vec(),
        });
        self.shared.arrivals.notify_one();
    }

    /// Close every open connection without a BYE, as a crashed or
    /// restarted server would.
    pub fn drop_connections(&self) {
        self.kick.send_replace(());
    }
}

impl Drop for FakeImapServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.kick.send_replace(());
    }
}

async fn handle_connection(
    stream: TcpStream,
    transport: Transport,
    acceptor: TlsAcceptor,
    shared: &Shared,
) {
    let tcp = match transport {
        Transport::ImplicitTls => stream,
        Transport::StartTls => match negotiate_starttls(stream).await {
            Some(tcp) => tcp,
            None => return,
        },
    };

    let Ok(tls_stream) = acceptor.accept(tcp).await else {
        return;
    };
    let mut reader = BufReader::new(tls_stream);

    if transport == Transport::ImplicitTls && write_line(&mut reader, GREETING).await.is_err() {
        return;
    }
    handle_imap_session(reader, shared).await;
}

/// Greet in clear text and wait for STARTTLS. Returns the raw stream
/// ready for the TLS handshake.
async fn negotiate_starttls(stream: TcpStream) -> Option<TcpStream> {
    let mut reader = BufReader::new(stream);
    write_line(&mut reader, GREETING).await.ok()?;

    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let mut words = line.split_whitespace();
    let tag = words.next()?.to_string();

    if !words.next().is_some_and(|c| c.eq_ignore_ascii_case("STARTTLS")) {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return None;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    write_line(&mut reader, &resp).await.ok()?;
    Some(reader.into_inner())
}

fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the command loop over an established TLS stream.
///
/// IDLE is recognized on the raw line. Everything else is decoded
/// with imap-codec's `CommandCodec` and dispatched on `CommandBody`.
/// Read handlers get a snapshot taken under the lock, write handlers
/// lock briefly themselves.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    shared: &Shared,
) {
    let mut selected_folder: Option<String> = None;
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(tag) = is_idle_command(trimmed) {
            if selected_folder.is_none() {
                let resp = format!("{tag} BAD No folder selected\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
                continue;
            }
            if !handle_idle(tag, &shared.mailbox, &shared.arrivals, &mut reader).await {
                break;
            }
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();
        let snap = {
            let mut mb = shared.mailbox.lock().unwrap();
            // A fresh SELECT sees mail delivered since the last one.
            if matches!(command.body, CommandBody::Select { .. }) {
                mb.deliver_arrivals();
            }
            mb.clone()
        };

        match command.body {
            CommandBody::Capability => {
                handle_capability(tag, snap.idle, &mut reader).await;
            }
            CommandBody::Login { .. } => {
                if !handle_login(tag, snap.accept_login, &mut reader).await {
                    break;
                }
            }
            CommandBody::Select { mailbox: mb, .. } => {
                let name = mailbox_name(&mb);
                selected_folder = handle_select(tag, &name, &snap, &mut reader).await;
            }
            CommandBody::Search {
                criteria,
                uid: true,
                ..
            } => {
                handle_uid_search(
                    tag,
                    criteria.as_ref(),
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Fetch {
                sequence_set,
                uid: true,
                ..
            } => {
                handle_uid_fetch(
                    tag,
                    &sequence_set,
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Store {
                ref sequence_set,
                uid: true,
                ref kind,
                ref response,
                ref flags,
                ..
            } => {
                let args = StoreArgs {
                    sequence_set,
                    kind,
                    response,
                    flags,
                };
                handle_uid_store(
                    tag,
                    &args,
                    &shared.mailbox,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
