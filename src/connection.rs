//! IMAP transport setup
//!
//! Opens the TCP connection, secures it (implicit TLS or STARTTLS) and
//! logs in. Everything above this works on an authenticated
//! [`ImapSession`].

use crate::config::{ImapConfig, Security};
use crate::error::{Error, Result};
use async_imap::Session;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

/// The secured transport under an IMAP session.
pub type ImapStream = Compat<tokio_rustls::client::TlsStream<TcpStream>>;

/// A TLS-wrapped IMAP session.
pub type ImapSession = Session<ImapStream>;

/// Build the TLS connector.
///
/// Verifies against the webpki roots unless `accept_invalid_certs` is
/// set, in which case any certificate is accepted (local bridges with
/// self-signed certificates).
fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

pub(crate) fn imap_error(context: &str) -> impl FnOnce(async_imap::error::Error) -> Error + '_ {
    move |e| match e {
        async_imap::error::Error::Io(io) => {
            Error::Transport(format!("{context}: {io}"))
        }
        other => Error::Protocol(format!("{context}: {other}")),
    }
}

/// Open a fresh authenticated IMAP session.
///
/// Connects to `config.host:config.port`, secures the stream per
/// `config.security` and logs in.
pub async fn connect(config: &ImapConfig) -> Result<ImapSession> {
    let addr = format!("{}:{}", config.host, config.port);
    debug!("Connecting to IMAP server at {}", addr);

    let tcp_stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::Transport(format!("Cannot connect to {addr}: {e}")))?;

    let connector = tls_connector(config.accept_invalid_certs)?;
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

    let tcp_stream = match config.security {
        Security::Tls => tcp_stream,
        Security::StartTls => {
            let mut client = async_imap::Client::new(tcp_stream.compat());
            client
                .run_command_and_check_ok("STARTTLS", None)
                .await
                .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))?;
            client.into_inner().into_inner()
        }
    };

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    let tls_client = async_imap::Client::new(tls_stream.compat());

    let session = tls_client
        .login(&config.username, &config.password)
        .await
        .map_err(|(e, _)| imap_error("Login failed")(e))?;

    info!(host = %config.host, user = %config.username, "Connected to IMAP server");
    Ok(session)
}

/// Whether the server advertises IDLE.
pub async fn supports_idle(session: &mut ImapSession) -> Result<bool> {
    let capabilities = session
        .capabilities()
        .await
        .map_err(imap_error("CAPABILITY failed"))?;
    Ok(capabilities.has_str("IDLE"))
}

/// SELECT a mailbox, returning its message count.
pub async fn select(session: &mut ImapSession, mailbox: &str) -> Result<u32> {
    let selected = session
        .select(mailbox)
        .await
        .map_err(imap_error("SELECT failed"))?;
    Ok(selected.exists)
}

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
