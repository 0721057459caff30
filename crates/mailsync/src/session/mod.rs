//! Transport session abstraction and the mailbox client built on it
//!
//! The [`MailSession`] trait is the seam between the sync engines and the
//! wire protocol: one authenticated command stream with folder listing,
//! search, fetch, append, delete, move and a blocking wait-for-change
//! primitive. [`MailboxClient`] wraps one session behind a mutex and adds
//! the folder-level operations the orchestrator drives.

mod client;
mod imap;
mod memory;

pub use client::{
    ClientOptions, IndexSink, MailboxClient, WATCH_MAX_DURATION, WATCH_TIMEOUT, Watch,
    WatchStatus,
};
pub use memory::InMemorySession;
pub use self::imap::{ImapTransport, connect};

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};

/// A listed folder with its type flags.
#[derive(Debug, Clone)]
pub struct Folder {
    pub name: String,
    /// Backslash-prefixed type flags, e.g. `\Noselect`, `\Trash`.
    pub flags: Vec<String>,
}

/// A message fetched from the selected folder.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    /// Server-assigned internal date.
    pub date: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
}

/// Outcome of one blocking wait on the push-notification primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The selected folder changed.
    Notified,
    /// The timeout elapsed without a notification.
    TimedOut,
}

/// Metadata derived for one stored message, handed to the index callback.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub mailbox: String,
    pub folder: String,
    pub email_id: String,
    pub store_id: String,
    pub labels: Vec<String>,
    pub sender: Vec<String>,
    pub recipients: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    pub subject: String,
}

/// Error for operations the server's capability set does not allow.
#[derive(Debug, thiserror::Error)]
#[error("server does not support {0}")]
pub struct Unsupported(pub &'static str);

/// One authenticated command stream to a mail server.
///
/// Implementations are not required to be thread-safe beyond `Send`; the
/// client serializes all access behind a mutex.
pub trait MailSession: Send {
    /// Capability atoms advertised by the server.
    fn capabilities(&mut self) -> Result<Vec<String>>;

    fn list_folders(&mut self) -> Result<Vec<Folder>>;

    /// Select a folder, returning the number of messages it holds.
    fn select_folder(&mut self, folder: &str, readonly: bool) -> Result<u32>;

    fn create_folder(&mut self, folder: &str) -> Result<()>;

    fn folder_exists(&mut self, folder: &str) -> Result<bool>;

    fn unselect_folder(&mut self) -> Result<()>;

    /// Ids of undeleted messages in the selected folder, optionally
    /// restricted to those arriving on or after `since`.
    fn search(&mut self, since: Option<NaiveDate>) -> Result<Vec<u32>>;

    fn fetch_messages(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>>;

    /// Append a message to a folder with the given internal date.
    fn append(&mut self, folder: &str, body: &[u8], date: Option<DateTime<Utc>>) -> Result<()>;

    /// Flag messages in the selected folder as deleted.
    fn delete_messages(&mut self, uids: &[u32]) -> Result<()>;

    fn expunge(&mut self) -> Result<()>;

    fn move_message(&mut self, uid: u32, folder: &str) -> Result<()>;

    /// Provider-specific per-message labels; empty when the extension is
    /// unavailable.
    fn fetch_labels(&mut self, uid: u32) -> Result<Vec<String>>;

    /// Block until the selected folder changes or `timeout` elapses.
    fn idle_wait(&mut self, timeout: Duration) -> Result<IdleOutcome>;

    fn logout(&mut self) -> Result<()>;
}

/// Optional protocol extensions, probed once when the client is built.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCaps {
    /// Server-side message move.
    pub supports_move: bool,
    /// Provider label extension (per-message labels beside folders).
    pub provider_labels: bool,
}

impl SessionCaps {
    pub fn from_capabilities(capabilities: &[String]) -> Self {
        Self {
            supports_move: capabilities.iter().any(|cap| cap == "MOVE"),
            provider_labels: capabilities.iter().any(|cap| cap.starts_with("X-GM-")),
        }
    }
}
