//! Mailbox client: serialized folder operations over one session
//!
//! One client owns one transport session behind a mutex. Every public
//! operation acquires the lock once and drives the session through
//! private helpers, so a blocking watch and ordinary commands can never
//! interleave on the same connection.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use log::{debug, error, info, warn};
use regex::Regex;

use crate::headers;
use crate::job::MailboxJob;
use crate::journal;
use crate::store::ContentStore;

use super::{
    FetchedMessage, Folder, IdleOutcome, MailSession, MessageMeta, SessionCaps, Unsupported,
};

/// Messages fetched per round trip, bounding memory and per-call latency.
const FETCH_CHUNK: usize = 10;
/// Default idle poll timeout.
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(20);
/// Default watch duration before the caller should refresh the session.
pub const WATCH_MAX_DURATION: Duration = Duration::from_secs(3600);

/// Sink receiving the derived metadata of each stored message.
pub type IndexSink<'a> = &'a mut dyn FnMut(MessageMeta) -> Result<()>;

/// Job options that affect folder operations.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub delete_after_export: bool,
    pub exchange_journal: bool,
    pub trash_folder: Option<String>,
    pub error_folder: Option<String>,
    pub ignore_folder_flags: Vec<String>,
    pub ignore_folder_names: Vec<String>,
}

impl ClientOptions {
    pub fn from_job(job: &MailboxJob) -> Self {
        Self {
            delete_after_export: job.delete_after_export,
            exchange_journal: job.exchange_journal,
            trash_folder: job.trash_folder.clone(),
            error_folder: job.error_folder.clone(),
            ignore_folder_flags: job.ignore_folder_flags.clone(),
            ignore_folder_names: job.ignore_folder_names.clone(),
        }
    }
}

/// Folder-level operations over one serialized transport session.
pub struct MailboxClient {
    session: Mutex<Box<dyn MailSession>>,
    caps: SessionCaps,
    opts: ClientOptions,
    job_name: String,
}

impl MailboxClient {
    /// Wrap an already authenticated session.
    ///
    /// The capability set is probed once here and carried alongside the
    /// session. An error folder without server-side move support is
    /// unusable and is dropped.
    pub fn new(
        mut session: Box<dyn MailSession>,
        job_name: &str,
        mut opts: ClientOptions,
    ) -> Result<Self> {
        let caps = SessionCaps::from_capabilities(&session.capabilities()?);
        if !caps.supports_move {
            opts.error_folder = None;
        }
        Ok(Self {
            session: Mutex::new(session),
            caps,
            opts,
            job_name: job_name.to_string(),
        })
    }

    /// Connect and authenticate per the job's transport settings.
    pub fn open(job: &MailboxJob) -> Result<Self> {
        let session = super::connect(job)?;
        Self::new(Box::new(session), &job.name, ClientOptions::from_job(job))
    }

    pub fn caps(&self) -> SessionCaps {
        self.caps
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn MailSession>> {
        self.session.lock().unwrap()
    }

    /// List folders, dropping those matching the configured ignore flags
    /// or name patterns.
    pub fn folders(&self) -> Result<Vec<Folder>> {
        let folders = self.lock().list_folders()?;
        Ok(folders
            .into_iter()
            .filter(|folder| !self.ignored_by_flags(folder) && !self.ignored_by_name(folder))
            .collect())
    }

    fn ignored_by_flags(&self, folder: &Folder) -> bool {
        self.opts.ignore_folder_flags.iter().any(|flag| {
            let canonical = canonical_flag(flag);
            folder
                .flags
                .iter()
                .any(|have| have.eq_ignore_ascii_case(&canonical))
        })
    }

    fn ignored_by_name(&self, folder: &Folder) -> bool {
        self.opts
            .ignore_folder_names
            .iter()
            .any(|pattern| match Regex::new(pattern) {
                // Anchored match: the pattern must hit at the start.
                Ok(re) => re.find(&folder.name).is_some_and(|m| m.start() == 0),
                Err(err) => {
                    warn!(
                        "{}: invalid folder name pattern '{}': {}",
                        self.job_name, pattern, err
                    );
                    false
                }
            })
    }

    /// Back up one folder into the store.
    ///
    /// Returns `(copied, found)`: messages that made it through the pass
    /// and messages matched by the search. Per-message failures are logged
    /// and skipped; a folder-level failure unselects the folder and
    /// propagates so the caller withholds the snapshot watermark.
    pub fn folder_backup(
        &self,
        folder: &str,
        store: &ContentStore,
        since: Option<DateTime<Utc>>,
        mut on_indexed: Option<IndexSink<'_>>,
    ) -> Result<(usize, usize)> {
        let mut guard = self.lock();
        let session = &mut **guard;
        let in_folder = session.select_folder(folder, !self.opts.delete_after_export)?;
        let mut result =
            self.folder_backup_inner(session, folder, in_folder, store, since, &mut on_indexed);
        if result.is_ok() && self.opts.delete_after_export {
            if let Err(err) = session.expunge() {
                result = Err(err);
            }
        }
        if let Err(err) = &result {
            error!("{}::{}: {}", self.job_name, folder, err);
        }
        let _ = session.unselect_folder();
        if result.is_ok()
            && self.caps.provider_labels
            && let Some(trash) = self.opts.trash_folder.clone()
        {
            // Provider quirk: deleted messages pile up in the trash folder
            // instead of being expunged; clear it after the pass.
            clear_folder(session, &self.job_name, &trash);
        }
        result
    }

    fn folder_backup_inner(
        &self,
        session: &mut dyn MailSession,
        folder: &str,
        in_folder: u32,
        store: &ContentStore,
        since: Option<DateTime<Utc>>,
        on_indexed: &mut Option<IndexSink<'_>>,
    ) -> Result<(usize, usize)> {
        let uids = search_since(session, since)?;
        let found = uids.len();
        if found as u32 != in_folder {
            info!(
                "{}::{}: found {}/{} messages",
                self.job_name, folder, found, in_folder
            );
        } else {
            info!("{}::{}: found {} messages", self.job_name, folder, found);
        }
        let mut copied = 0;
        for chunk in uids.chunks(FETCH_CHUNK) {
            debug!("{}::{}: fetching {:?}", self.job_name, folder, chunk);
            let fetched = match session.fetch_messages(chunk) {
                Ok(fetched) => fetched,
                Err(err) => {
                    error!("{}::{}{:?}: {}", self.job_name, folder, chunk, err);
                    continue;
                }
            };
            for message in fetched {
                if self.backup_one(session, folder, store, on_indexed, &message)? {
                    copied += 1;
                }
            }
        }
        Ok((copied, found))
    }

    /// Process a single message; `Ok(false)` means skipped.
    fn backup_one(
        &self,
        session: &mut dyn MailSession,
        folder: &str,
        store: &ContentStore,
        on_indexed: &mut Option<IndexSink<'_>>,
        message: &FetchedMessage,
    ) -> Result<bool> {
        let mut unwrapped = None;
        if self.opts.exchange_journal {
            match journal::unwrap_journal_message(&message.body) {
                Ok(Some(inner)) => unwrapped = Some(inner),
                Ok(None) => {
                    if let Some(error_folder) = self.opts.error_folder.clone() {
                        warn!(
                            "{}::{}[{}]: not a journal item, moving to error folder",
                            self.job_name, folder, message.uid
                        );
                        if let Err(err) = self.move_locked(session, message.uid, &error_folder) {
                            error!(
                                "{}::{}[{}]: move to error folder failed: {}",
                                self.job_name, folder, message.uid, err
                            );
                        }
                    } else {
                        warn!(
                            "{}::{}[{}]: not a journal item, skipping",
                            self.job_name, folder, message.uid
                        );
                    }
                    return Ok(false);
                }
                Err(err) => {
                    error!(
                        "{}::{}[{}]: journal unwrap failed: {}",
                        self.job_name, folder, message.uid, err
                    );
                    return Ok(false);
                }
            }
        }
        let body = unwrapped.as_deref().unwrap_or(&message.body);

        let added = match store.add(body) {
            Ok(added) => added,
            Err(err) => {
                error!(
                    "{}::{}[{}]: {}",
                    self.job_name, folder, message.uid, err
                );
                return Ok(false);
            }
        };
        info!(
            "{}::{}[{}]: {}: id={}",
            self.job_name, folder, message.uid, added.status, added.digest
        );

        if let Some(callback) = on_indexed.as_deref_mut() {
            match self.collect_metadata(session, folder, added.digest, body, message.uid) {
                Ok(meta) => {
                    if let Err(err) = callback(meta) {
                        error!(
                            "{}::{}[{}]: error in index callback: {}",
                            self.job_name, folder, message.uid, err
                        );
                        return Ok(false);
                    }
                }
                Err(err) => {
                    error!(
                        "{}::{}[{}]: metadata derivation failed: {}",
                        self.job_name, folder, message.uid, err
                    );
                    return Ok(false);
                }
            }
        }

        if self.opts.delete_after_export {
            debug!(
                "{}::{}: deleting {}",
                self.job_name, folder, message.uid
            );
            session.delete_messages(&[message.uid])?;
        }
        Ok(true)
    }

    fn collect_metadata(
        &self,
        session: &mut dyn MailSession,
        folder: &str,
        store_id: String,
        body: &[u8],
        uid: u32,
    ) -> Result<MessageMeta> {
        let labels = if self.caps.provider_labels {
            let mut labels = session.fetch_labels(uid)?;
            if !folder.starts_with("[Google Mail]") {
                labels.insert(0, folder.to_string());
            }
            labels
        } else {
            vec![folder.to_string()]
        };
        let parsed = headers::parse_message_meta(body)?;
        Ok(MessageMeta {
            mailbox: self.job_name.clone(),
            folder: folder.to_string(),
            email_id: parsed.email_id,
            store_id,
            labels,
            sender: parsed.sender,
            recipients: parsed.recipients,
            date: parsed.date,
            subject: parsed.subject,
        })
    }

    /// Back up every non-ignored folder, continuing past failed folders.
    pub fn full_backup(
        &self,
        store: &ContentStore,
        since: Option<DateTime<Utc>>,
        mut on_indexed: Option<IndexSink<'_>>,
    ) -> Result<()> {
        for folder in self.folders()? {
            let reborrowed = on_indexed.as_mut().map(|cb| &mut **cb as IndexSink<'_>);
            if let Err(err) = self.folder_backup(&folder.name, store, since, reborrowed) {
                error!("{}::{}: {}", self.job_name, folder.name, err);
            }
        }
        Ok(())
    }

    /// Stream a folder's messages through `each` without storing them.
    ///
    /// Selection matches [`folder_backup`](Self::folder_backup): undeleted
    /// messages, optionally since a watermark backed up by one day. With
    /// delete-after-export, streamed messages are deleted and the folder
    /// is expunged once the stream completes.
    pub fn get_messages(
        &self,
        folder: &str,
        since: Option<DateTime<Utc>>,
        each: &mut dyn FnMut(FetchedMessage) -> Result<()>,
    ) -> Result<()> {
        let mut guard = self.lock();
        let session = &mut **guard;
        let in_folder = session.select_folder(folder, !self.opts.delete_after_export)?;
        let mut result = self.get_messages_inner(session, folder, in_folder, since, each);
        if result.is_ok() && self.opts.delete_after_export {
            if let Err(err) = session.expunge() {
                result = Err(err);
            }
        }
        if let Err(err) = &result {
            error!("{}::{}: {}", self.job_name, folder, err);
        }
        let _ = session.unselect_folder();
        result
    }

    fn get_messages_inner(
        &self,
        session: &mut dyn MailSession,
        folder: &str,
        in_folder: u32,
        since: Option<DateTime<Utc>>,
        each: &mut dyn FnMut(FetchedMessage) -> Result<()>,
    ) -> Result<()> {
        let uids = search_since(session, since)?;
        let found = uids.len();
        if found as u32 != in_folder {
            info!(
                "{}::{}: found {}/{} messages",
                self.job_name, folder, found, in_folder
            );
        } else {
            info!("{}::{}: found {} messages", self.job_name, folder, found);
        }
        for chunk in uids.chunks(FETCH_CHUNK) {
            let fetched = match session.fetch_messages(chunk) {
                Ok(fetched) => fetched,
                Err(err) => {
                    error!("{}::{}{:?}: {}", self.job_name, folder, chunk, err);
                    continue;
                }
            };
            for message in fetched {
                info!("{}::{}[{}]: fetched", self.job_name, folder, message.uid);
                let uid = message.uid;
                each(message)?;
                if self.opts.delete_after_export {
                    session.delete_messages(&[uid])?;
                }
            }
        }
        Ok(())
    }

    /// Copy every message in `folder` to the same folder on `dest`.
    ///
    /// With `archive_template` set, each copied message is moved into the
    /// strftime-expanded archive folder on this mailbox, falling back to
    /// append + delete when the server cannot move.
    pub fn copy_folder_to(
        &self,
        dest: &MailboxClient,
        folder: &str,
        archive_template: Option<&str>,
    ) -> Result<usize> {
        let mut guard = self.lock();
        let session = &mut **guard;
        let in_folder = session.select_folder(folder, !self.opts.delete_after_export)?;
        let mut result = self.copy_folder_inner(session, dest, folder, in_folder, archive_template);
        if result.is_ok() && self.opts.delete_after_export {
            if let Err(err) = session.expunge() {
                result = Err(err);
            }
        }
        if let Err(err) = &result {
            error!("{}::{}: {}", self.job_name, folder, err);
        }
        let _ = session.unselect_folder();
        result
    }

    fn copy_folder_inner(
        &self,
        session: &mut dyn MailSession,
        dest: &MailboxClient,
        folder: &str,
        in_folder: u32,
        archive_template: Option<&str>,
    ) -> Result<usize> {
        let uids = search_since(session, None)?;
        let found = uids.len();
        if found as u32 != in_folder {
            info!(
                "{}::{}: found {}/{} messages",
                self.job_name, folder, found, in_folder
            );
        } else {
            info!("{}::{}: found {} messages", self.job_name, folder, found);
        }
        let mut copied = 0;
        for chunk in uids.chunks(FETCH_CHUNK) {
            let fetched = match session.fetch_messages(chunk) {
                Ok(fetched) => fetched,
                Err(err) => {
                    error!("{}::{}{:?}: {}", self.job_name, folder, chunk, err);
                    continue;
                }
            };
            for message in fetched {
                info!("{}::{}[{}]: fetched", self.job_name, folder, message.uid);
                dest.save_message(&message.body, folder, message.date)?;
                if let Some(template) = archive_template {
                    let archive = format_archive_folder(template);
                    info!(
                        "{}::{}: moving message '{}' to folder '{}'",
                        self.job_name, folder, message.uid, archive
                    );
                    match self.move_locked(session, message.uid, &archive) {
                        Ok(()) => {}
                        Err(err) if err.is::<Unsupported>() => {
                            // No server-side move: save a copy and hard
                            // delete the original.
                            append_to(session, &archive, &message.body, message.date)?;
                            session.delete_messages(&[message.uid])?;
                            session.expunge()?;
                        }
                        Err(err) => return Err(err),
                    }
                } else if self.opts.delete_after_export {
                    session.delete_messages(&[message.uid])?;
                }
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Append a message to a folder, creating the folder when absent.
    pub fn save_message(
        &self,
        body: &[u8],
        folder: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut guard = self.lock();
        append_to(&mut **guard, folder, body, date)
    }

    /// Move a message to another folder; requires the move capability.
    pub fn move_message(&self, uid: u32, folder: &str) -> Result<()> {
        let mut guard = self.lock();
        self.move_locked(&mut **guard, uid, folder)
    }

    /// Flag a message as deleted, optionally expunging right away.
    pub fn delete_message(&self, uid: u32, expunge: bool) -> Result<()> {
        let mut guard = self.lock();
        guard.delete_messages(&[uid])?;
        if expunge {
            guard.expunge()?;
        }
        Ok(())
    }

    fn move_locked(&self, session: &mut dyn MailSession, uid: u32, folder: &str) -> Result<()> {
        if !self.caps.supports_move {
            return Err(Unsupported("MOVE").into());
        }
        if !session.folder_exists(folder)? {
            session.create_folder(folder)?;
        }
        session.move_message(uid, folder)
    }

    /// Start watching a folder for pushed change notifications.
    pub fn watch_folder(
        &self,
        folder: &str,
        timeout: Duration,
        max_duration: Duration,
    ) -> Watch<'_> {
        Watch {
            client: self,
            folder: folder.to_string(),
            timeout,
            max_duration,
            started: Instant::now(),
        }
    }

    pub fn logout(&self) -> Result<()> {
        self.lock().logout()
    }
}

/// Why a watch wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// The server pushed a change notification.
    Notified,
    /// The watch ended: max duration reached, or the connection is
    /// considered dead. The caller refreshes the session and starts over.
    Ended,
}

/// A restartable watch on one folder.
pub struct Watch<'a> {
    client: &'a MailboxClient,
    folder: String,
    timeout: Duration,
    max_duration: Duration,
    started: Instant,
}

impl Watch<'_> {
    /// Block until the next notification.
    ///
    /// The session lock is held for the duration of each wait, so no other
    /// command can interleave with the idle state; it is released between
    /// calls so the caller can run ordinary commands on notification.
    pub fn next_notification(&mut self) -> Result<WatchStatus> {
        let client = self.client;
        let mut guard = client.lock();
        let session = &mut **guard;
        if self.started.elapsed() >= self.max_duration {
            return Ok(WatchStatus::Ended);
        }
        if !session.folder_exists(&self.folder)? {
            session.create_folder(&self.folder)?;
        }
        session.select_folder(&self.folder, true)?;
        loop {
            if self.started.elapsed() >= self.max_duration {
                return Ok(WatchStatus::Ended);
            }
            let poll_started = Instant::now();
            let outcome = session.idle_wait(self.timeout.max(Duration::from_secs(10)))?;
            debug!(
                "{}::{}: idle returned {:?}",
                client.job_name, self.folder, outcome
            );
            match outcome {
                IdleOutcome::Notified => return Ok(WatchStatus::Notified),
                IdleOutcome::TimedOut => {
                    // The wait primitive does not always surface a dead
                    // connection as an error; returning well before the
                    // timeout without a notification is the tell.
                    if poll_started.elapsed() < self.timeout / 2 {
                        warn!(
                            "{}::{}: idle connection broken",
                            client.job_name, self.folder
                        );
                        return Ok(WatchStatus::Ended);
                    }
                }
            }
        }
    }
}

/// Search honoring the snapshot watermark.
fn search_since(
    session: &mut dyn MailSession,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<u32>> {
    // Back the watermark up a day to absorb server-side date granularity
    // and clock skew.
    let since = since.map(|s| (s - ChronoDuration::days(1)).date_naive());
    session.search(since)
}

fn append_to(
    session: &mut dyn MailSession,
    folder: &str,
    body: &[u8],
    date: Option<DateTime<Utc>>,
) -> Result<()> {
    if !session.folder_exists(folder)? {
        session.create_folder(folder)?;
    }
    session.append(folder, body, date)
}

/// Best-effort removal of every message in a folder.
fn clear_folder(session: &mut dyn MailSession, job_name: &str, folder: &str) {
    match session.select_folder(folder, false) {
        Ok(_) => {
            let run = session.search(None).and_then(|uids| {
                for chunk in uids.chunks(FETCH_CHUNK) {
                    session.delete_messages(chunk)?;
                }
                Ok(())
            });
            if let Err(err) = run {
                error!("{}::{}: {}", job_name, folder, err);
            }
            if let Err(err) = session.expunge() {
                error!("{}::{}: {}", job_name, folder, err);
            }
            let _ = session.unselect_folder();
        }
        Err(err) => error!("{}::{}: {}", job_name, folder, err),
    }
}

fn canonical_flag(flag: &str) -> String {
    let mut chars = flag.chars();
    match chars.next() {
        Some(first) => format!(
            "\\{}{}",
            first.to_uppercase(),
            chars.as_str().to_lowercase()
        ),
        None => "\\".to_string(),
    }
}

/// Expand a strftime-style archive folder template at move time.
fn format_archive_folder(template: &str) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    if write!(out, "{}", Local::now().format(template)).is_err() {
        warn!("invalid archive folder template '{}'", template);
        return template.to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySession;
    use tempfile::tempdir;

    fn client_for(session: &InMemorySession) -> MailboxClient {
        MailboxClient::new(
            Box::new(session.clone()),
            "testjob",
            ClientOptions::default(),
        )
        .unwrap()
    }

    fn message(n: u32) -> Vec<u8> {
        format!(
            "From: sender{n}@example.com\r\n\
To: recipient@example.com\r\n\
Subject: Message {n}\r\n\
Message-Id: <msg-{n}@example.com>\r\n\
Date: Wed, 04 Jun 2025 10:0{n}:00 +0000\r\n\
\r\n\
Body {n}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_folders_filtering() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        session.add_folder_with_flags("All Mail", &["\\All"]);
        session.add_folder("Spam-Reports");
        session.add_folder("Archive");

        let mut opts = ClientOptions::default();
        opts.ignore_folder_flags = vec!["all".to_string()];
        opts.ignore_folder_names = vec!["Spam".to_string()];
        let client =
            MailboxClient::new(Box::new(session.clone()), "testjob", opts).unwrap();

        let names: Vec<String> = client
            .folders()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["INBOX".to_string(), "Archive".to_string()]);
    }

    #[test]
    fn test_folder_backup_counts_and_metadata() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        for n in 1..=3 {
            session.add_message("INBOX", None, &message(n));
        }
        let client = client_for(&session);

        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();

        let mut seen = Vec::new();
        let mut sink = |meta: MessageMeta| -> Result<()> {
            seen.push(meta);
            Ok(())
        };
        let (copied, found) = client
            .folder_backup("INBOX", &store, None, Some(&mut sink))
            .unwrap();
        assert_eq!((copied, found), (3, 3));
        assert_eq!(store.walk().count(), 3);
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|m| m.labels == vec!["INBOX".to_string()]));
        assert!(seen.iter().all(|m| m.mailbox == "testjob"));

        // A second pass dedups in the store but still reports the copies.
        let (copied, found) = client.folder_backup("INBOX", &store, None, None).unwrap();
        assert_eq!((copied, found), (3, 3));
        assert_eq!(store.walk().count(), 3);
    }

    #[test]
    fn test_folder_backup_failure_propagates() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        session.add_message("INBOX", None, &message(1));
        session.fail_search_in("INBOX");
        let client = client_for(&session);

        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();
        assert!(client.folder_backup("INBOX", &store, None, None).is_err());
    }

    #[test]
    fn test_delete_after_export() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        session.add_message("INBOX", None, &message(1));

        let mut opts = ClientOptions::default();
        opts.delete_after_export = true;
        let client =
            MailboxClient::new(Box::new(session.clone()), "testjob", opts).unwrap();

        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();
        let (copied, _) = client.folder_backup("INBOX", &store, None, None).unwrap();
        assert_eq!(copied, 1);
        assert_eq!(session.message_count("INBOX"), 0);
    }

    #[test]
    fn test_journal_non_item_skipped() {
        let session = InMemorySession::new();
        session.add_folder("Journal");
        // A plain message is not a journal envelope.
        session.add_message("Journal", None, &message(1));

        let mut opts = ClientOptions::default();
        opts.exchange_journal = true;
        let client =
            MailboxClient::new(Box::new(session.clone()), "testjob", opts).unwrap();

        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();
        let (copied, found) = client.folder_backup("Journal", &store, None, None).unwrap();
        assert_eq!((copied, found), (0, 1));
        assert_eq!(store.walk().count(), 0);
    }

    #[test]
    fn test_move_requires_capability() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        let uid = session.add_message("INBOX", None, &message(1));
        let client = client_for(&session);

        let err = client.move_message(uid, "Elsewhere").unwrap_err();
        assert!(err.is::<Unsupported>());

        let session = InMemorySession::new().with_capability("MOVE");
        session.add_folder("INBOX");
        let uid = session.add_message("INBOX", None, &message(1));
        let client = client_for(&session);
        client.lock().select_folder("INBOX", false).unwrap();
        client.move_message(uid, "Elsewhere").unwrap();
        assert_eq!(session.message_count("Elsewhere"), 1);
    }

    #[test]
    fn test_get_messages_streams_folder() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        session.add_message("INBOX", None, &message(1));
        session.add_message("INBOX", None, &message(2));
        let client = client_for(&session);

        let mut bodies = Vec::new();
        let mut each = |msg: FetchedMessage| -> Result<()> {
            bodies.push(msg.body);
            Ok(())
        };
        client.get_messages("INBOX", None, &mut each).unwrap();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].starts_with(b"From: sender1@example.com"));
    }

    #[test]
    fn test_copy_folder_to_destination() {
        let source = InMemorySession::new();
        source.add_folder("INBOX");
        source.add_message("INBOX", None, &message(1));
        source.add_message("INBOX", None, &message(2));
        let from = client_for(&source);

        let dest = InMemorySession::new();
        let to = client_for(&dest);

        let copied = from.copy_folder_to(&to, "INBOX", None).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(dest.message_count("INBOX"), 2);
        // Source untouched without archiving.
        assert_eq!(source.message_count("INBOX"), 2);
    }

    #[test]
    fn test_copy_with_archive_falls_back_without_move() {
        let source = InMemorySession::new();
        source.add_folder("INBOX");
        source.add_message("INBOX", None, &message(1));
        let from = client_for(&source);

        let dest = InMemorySession::new();
        let to = client_for(&dest);

        let copied = from.copy_folder_to(&to, "INBOX", Some("Archive-%Y")).unwrap();
        assert_eq!(copied, 1);
        assert_eq!(dest.message_count("INBOX"), 1);
        // Fallback saved a copy into the expanded archive folder and hard
        // deleted the original.
        let archive = format_archive_folder("Archive-%Y");
        assert_eq!(source.message_count(&archive), 1);
        assert_eq!(source.message_count("INBOX"), 0);
    }

    #[test]
    fn test_watch_notification_then_broken() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        session.script_idle(IdleOutcome::Notified);
        let client = client_for(&session);

        let mut watch = client.watch_folder("INBOX", WATCH_TIMEOUT, WATCH_MAX_DURATION);
        assert_eq!(watch.next_notification().unwrap(), WatchStatus::Notified);
        // The scripted queue is empty now: the in-memory idle returns
        // immediately, which the heuristic reads as a dead connection.
        assert_eq!(watch.next_notification().unwrap(), WatchStatus::Ended);
    }

    #[test]
    fn test_watch_expires_cleanly() {
        let session = InMemorySession::new();
        session.add_folder("INBOX");
        let client = client_for(&session);

        let mut watch = client.watch_folder("INBOX", WATCH_TIMEOUT, Duration::ZERO);
        assert_eq!(watch.next_notification().unwrap(), WatchStatus::Ended);
    }
}
