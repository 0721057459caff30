//! IMAP-backed transport session
//!
//! Thin binding of the [`MailSession`] trait onto the `imap` crate; the
//! TLS handshake and command framing live entirely in that crate.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use imap::extensions::idle::WaitOutcome;
use imap_proto::{Capability, NameAttribute};
use log::debug;

use crate::job::MailboxJob;

use super::{FetchedMessage, Folder, IdleOutcome, MailSession};

/// One authenticated IMAP session.
pub struct ImapTransport {
    session: imap::Session<imap::Connection>,
}

/// Open and authenticate a session for a job.
pub fn connect(job: &MailboxJob) -> Result<ImapTransport> {
    let mode = if job.tls {
        imap::ConnectionMode::Tls
    } else {
        imap::ConnectionMode::Plaintext
    };
    let mut builder = imap::ClientBuilder::new(&job.server, job.port).mode(mode);
    if !job.tls_check_hostname || !job.tls_verify_cert {
        builder = builder.danger_skip_tls_verify(true);
    }
    let client = builder
        .connect()
        .with_context(|| format!("Failed to connect to {}:{}", job.server, job.port))?;
    let session = client
        .login(&job.username, &job.password)
        .map_err(|(err, _)| anyhow!("Login failed for {}: {}", job.username, err))?;
    Ok(ImapTransport { session })
}

impl MailSession for ImapTransport {
    fn capabilities(&mut self) -> Result<Vec<String>> {
        let capabilities = self.session.capabilities()?;
        Ok(capabilities.iter().map(capability_name).collect())
    }

    fn list_folders(&mut self) -> Result<Vec<Folder>> {
        let names = self.session.list(None, Some("*"))?;
        Ok(names
            .iter()
            .map(|name| Folder {
                name: name.name().to_string(),
                flags: name.attributes().iter().map(attribute_flag).collect(),
            })
            .collect())
    }

    fn select_folder(&mut self, folder: &str, readonly: bool) -> Result<u32> {
        let mailbox = if readonly {
            self.session.examine(folder)?
        } else {
            self.session.select(folder)?
        };
        Ok(mailbox.exists)
    }

    fn create_folder(&mut self, folder: &str) -> Result<()> {
        self.session.create(folder)?;
        Ok(())
    }

    fn folder_exists(&mut self, folder: &str) -> Result<bool> {
        Ok(!self.session.list(None, Some(folder))?.is_empty())
    }

    fn unselect_folder(&mut self) -> Result<()> {
        self.session.close()?;
        Ok(())
    }

    fn search(&mut self, since: Option<NaiveDate>) -> Result<Vec<u32>> {
        let query = match since {
            Some(date) => format!("NOT DELETED SINCE {}", date.format("%d-%b-%Y")),
            None => "NOT DELETED".to_string(),
        };
        let mut uids: Vec<u32> = self.session.uid_search(&query)?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_messages(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        let set = uid_set(uids);
        debug!("fetching {}", set);
        let fetches = self.session.uid_fetch(&set, "(RFC822 INTERNALDATE)")?;
        let mut out = Vec::new();
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let Some(body) = fetch.body() else { continue };
            out.push(FetchedMessage {
                uid,
                date: fetch.internal_date().map(|date| date.with_timezone(&Utc)),
                body: body.to_vec(),
            });
        }
        Ok(out)
    }

    fn append(&mut self, folder: &str, body: &[u8], date: Option<DateTime<Utc>>) -> Result<()> {
        let mut command = self.session.append(folder, body);
        if let Some(date) = date {
            command.internal_date(date.fixed_offset());
        }
        command.finish()?;
        Ok(())
    }

    fn delete_messages(&mut self, uids: &[u32]) -> Result<()> {
        self.session
            .uid_store(uid_set(uids), "+FLAGS (\\Deleted)")?;
        Ok(())
    }

    fn expunge(&mut self) -> Result<()> {
        self.session.expunge()?;
        Ok(())
    }

    fn move_message(&mut self, uid: u32, folder: &str) -> Result<()> {
        self.session.uid_mv(uid.to_string(), folder)?;
        Ok(())
    }

    fn fetch_labels(&mut self, uid: u32) -> Result<Vec<String>> {
        // The transport crate does not model the label extension; issue
        // the fetch raw and parse the response line leniently.
        let command = format!("UID FETCH {} (X-GM-LABELS)", uid);
        let response = self.session.run_command_and_read_response(&command)?;
        Ok(parse_provider_labels(&String::from_utf8_lossy(&response)))
    }

    fn idle_wait(&mut self, timeout: Duration) -> Result<IdleOutcome> {
        let mut handle = self.session.idle();
        handle.timeout(timeout);
        match handle.wait_while(imap::extensions::idle::stop_on_any)? {
            WaitOutcome::MailboxChanged => Ok(IdleOutcome::Notified),
            WaitOutcome::TimedOut => Ok(IdleOutcome::TimedOut),
        }
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout()?;
        Ok(())
    }
}

impl Drop for ImapTransport {
    fn drop(&mut self) {
        let _ = self.session.logout();
    }
}

fn capability_name(capability: &Capability) -> String {
    match capability {
        Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        Capability::Auth(mechanism) => format!("AUTH={}", mechanism),
        Capability::Atom(atom) => atom.to_string(),
        other => format!("{:?}", other),
    }
}

fn attribute_flag(attribute: &NameAttribute) -> String {
    match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::Extension(name) => name.to_string(),
        // Special-use attributes (\All, \Trash, ...) debug-print as their
        // bare name.
        other => format!("\\{:?}", other),
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Pull label atoms out of an `X-GM-LABELS (…)` fetch response.
///
/// Quoted labels containing spaces come back split; good enough for the
/// system labels this is used for.
fn parse_provider_labels(response: &str) -> Vec<String> {
    const MARKER: &str = "X-GM-LABELS (";
    let Some(start) = response.find(MARKER) else {
        return Vec::new();
    };
    let rest = &response[start + MARKER.len()..];
    let Some(end) = rest.find(')') else {
        return Vec::new();
    };
    rest[..end]
        .split_whitespace()
        .map(|label| label.trim_matches('"').trim_start_matches('\\').to_string())
        .filter(|label| !label.is_empty())
        .collect()
}
