//! IDLE command handler (RFC 2177).
//!
//! imap-codec only decodes IDLE together with its DONE continuation,
//! so the server recognizes the command line itself and hands the
//! connection to this handler:
//!
//! ```text
//!   Client:  A0007 IDLE
//!   Server:  + idling
//!   Server:  * 4 EXISTS          (once per delivery)
//!   Client:  DONE
//!   Server:  A0007 OK IDLE terminated
//! ```

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Notify;

/// Return the tag if `line` is an IDLE command.
pub fn is_idle_command(line: &str) -> Option<&str> {
    let mut words = line.split_whitespace();
    let tag = words.next()?;
    let command = words.next()?;
    (command.eq_ignore_ascii_case("IDLE") && words.next().is_none()).then_some(tag)
}

/// Hold the connection in IDLE until the client sends DONE.
///
/// Queued arrivals are delivered on entry and whenever `arrivals` is
/// notified. Returns false if the connection broke.
pub async fn handle_idle<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    mailbox: &Mutex<Mailbox>,
    arrivals: &Notify,
    stream: &mut BufReader<S>,
) -> bool {
    if write_line(stream, "+ idling\r\n").await.is_err() {
        return false;
    }

    // Kept across iterations: read_line may be interrupted mid-line.
    let mut line = String::new();
    loop {
        let delivered = mailbox.lock().unwrap().deliver_arrivals();
        if let Some(exists) = delivered
            && write_line(stream, &format!("* {exists} EXISTS\r\n")).await.is_err()
        {
            return false;
        }

        let read = tokio::select! {
            read = stream.read_line(&mut line) => Some(read),
            () = arrivals.notified() => None,
        };
        match read {
            None => {}
            Some(Ok(0) | Err(_)) => return false,
            Some(Ok(_)) => break,
        }
    }

    let resp = if line.trim().eq_ignore_ascii_case("DONE") {
        format!("{tag} OK IDLE terminated\r\n")
    } else {
        format!("{tag} BAD Expected DONE\r\n")
    };
    write_line(stream, &resp).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn recognizes_idle_lines() {
        assert_eq!(is_idle_command("A0007 IDLE\r\n"), Some("A0007"));
        assert_eq!(is_idle_command("a1 idle"), Some("a1"));
        assert_eq!(is_idle_command("A1 NOOP"), None);
        assert_eq!(is_idle_command("IDLE"), None);
    }

    #[tokio::test]
    async fn queued_arrival_is_announced_on_entry() {
        let mailbox = Mutex::new(
            MailboxBuilder::new()
                .folder("INBOX")
                .email(1, true, b"old")
                .arrival(2, b"new")
                .build(),
        );
        let notify = Notify::new();
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"DONE\r\n").await.unwrap();

        let mut stream = BufReader::new(server);
        assert!(handle_idle("A7", &mailbox, &notify, &mut stream).await);
        drop(stream);

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "+ idling\r\n* 2 EXISTS\r\nA7 OK IDLE terminated\r\n");
        assert_eq!(mailbox.lock().unwrap().get_folder("INBOX").unwrap().emails.len(), 2);
    }

    #[tokio::test]
    async fn notification_wakes_idle_connection() {
        let mailbox = Arc::new(Mutex::new(MailboxBuilder::new().folder("INBOX").build()));
        let notify = Arc::new(Notify::new());
        let (client, server) = tokio::io::duplex(4096);

        let task = {
            let mailbox = mailbox.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                let mut stream = BufReader::new(server);
                handle_idle("A9", &mailbox, &notify, &mut stream).await
            })
        };

        let mut client = BufReader::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "+ idling\r\n");

        mailbox
            .lock()
            .unwrap()
            .arrivals
            .push_back(crate::fake_imap::mailbox::TestEmail {
                uid: 5,
                seen: false,
                raw: b"late".to_vec(),
            });
        notify.notify_one();

        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "* 1 EXISTS\r\n");

        client.get_mut().write_all(b"DONE\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "A9 OK IDLE terminated\r\n");
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn closed_connection_ends_idle() {
        let mailbox = Mutex::new(MailboxBuilder::new().folder("INBOX").build());
        let notify = Notify::new();
        let (client, server) = tokio::io::duplex(4096);
        drop(client);

        let mut stream = BufReader::new(server);
        assert!(!handle_idle("A1", &mailbox, &notify, &mut stream).await);
    }
}
