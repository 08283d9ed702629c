//! Raw message parsing
//!
//! Turns a fetched RFC 5322 message into an [`EmailMessage`]: decoded
//! sender and subject, the raw `Date` header, and every leaf MIME part
//! in document order.

use crate::error::{Error, Result};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

/// A parsed message, owned by the pipeline run that processes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub sender: String,
    pub subject: String,
    pub date: String,
    pub parts: Vec<AttachmentPart>,
}

impl EmailMessage {
    /// Parts that are stored as attachments.
    pub fn attachments(&self) -> impl Iterator<Item = &AttachmentPart> {
        self.parts.iter().filter(|p| p.is_attachment())
    }

    /// Whether any part declares itself an attachment, saved or not.
    #[must_use]
    pub fn declares_attachments(&self) -> bool {
        self.parts.iter().any(|p| p.disposition == Disposition::Attachment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
    Other,
}

impl From<&DispositionType> for Disposition {
    fn from(value: &DispositionType) -> Self {
        match value {
            DispositionType::Inline => Self::Inline,
            DispositionType::Attachment => Self::Attachment,
            _ => Self::Other,
        }
    }
}

/// One leaf MIME part.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub filename: Option<String>,
    pub disposition: Disposition,
    pub payload: Vec<u8>,
}

impl AttachmentPart {
    /// A part is stored only when it is an attachment with a non-empty
    /// filename and a non-empty payload.
    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.disposition == Disposition::Attachment
            && self.filename.as_deref().is_some_and(|f| !f.is_empty())
            && !self.payload.is_empty()
    }
}

impl std::fmt::Debug for AttachmentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentPart")
            .field("filename", &self.filename)
            .field("disposition", &self.disposition)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Parse a raw message.
///
/// Undecodable header bytes and transfer encodings degrade to lossy
/// text or empty payloads; only input that is not a message at all is
/// rejected with [`Error::Parse`].
pub fn parse_message(raw: &[u8]) -> Result<EmailMessage> {
    let mail = mailparse::parse_mail(raw).map_err(|e| Error::Parse(e.to_string()))?;

    if mail.headers.is_empty() {
        return Err(Error::Parse("message has no headers".into()));
    }

    let header = |name: &str| mail.headers.get_first_value(name).unwrap_or_default();

    let mut parts = Vec::new();
    collect_parts(&mail, &mut parts);

    Ok(EmailMessage {
        sender: header("From"),
        subject: header("Subject"),
        date: header("Date"),
        parts,
    })
}

fn collect_parts(mail: &ParsedMail<'_>, out: &mut Vec<AttachmentPart>) {
    if !mail.subparts.is_empty() {
        for sub in &mail.subparts {
            collect_parts(sub, out);
        }
        return;
    }

    let disposition = mail.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| mail.ctype.params.get("name"))
        .map(|raw| decode_words(raw));

    let payload = match mail.get_body_raw() {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!("Undecodable part body, treating as empty: {e}");
            Vec::new()
        }
    };

    out.push(AttachmentPart {
        filename,
        disposition: Disposition::from(&disposition.disposition),
        payload,
    });
}

/// Decode RFC 2047 encoded words inside a header parameter value.
fn decode_words(raw: &str) -> String {
    if !raw.contains("=?") {
        return raw.to_string();
    }
    let line = format!("X-Filename: {raw}");
    mailparse::parse_header(line.as_bytes())
        .map_or_else(|_| raw.to_string(), |(header, _)| header.get_value())
}
