//! mailsync - engines for mailbox backup into a content-addressed store
//!
//! This crate provides:
//! - A deduplicating content-addressed store for raw messages
//! - A SQLite metadata index with per-folder snapshot watermarks
//! - A transport session adapter serializing one authenticated session
//! - Sync orchestration: backup, mailbox-to-mailbox copy, live watch-copy
//! - Journal envelope unwrapping for compliance-journaled mailboxes
//!
//! The wire protocol lives behind the [`session::MailSession`] trait; the
//! engines never talk to a socket directly.

pub mod headers;
pub mod index;
pub mod job;
pub mod journal;
pub mod session;
pub mod store;
pub mod sync;

pub use headers::{MessageHeaders, parse_message_meta};
pub use index::{DuplicateRow, MessageRow, MetaIndex};
pub use job::{MailboxJob, find_job, load_jobs};
pub use journal::unwrap_journal_message;
pub use session::{
    ClientOptions, FetchedMessage, Folder, IdleOutcome, IndexSink, InMemorySession, MailSession,
    MailboxClient, MessageMeta, SessionCaps, Unsupported, Watch, WatchStatus, connect,
};
pub use store::{AddStatus, Added, ContentStore, StoreError};
pub use sync::{JobError, backup, backup_with, copy, copy_folder, folder_list, update_db_from_archive};
