//! Sync orchestration: backup, copy and index rebuild

mod backup;
mod copy;
mod reindex;

pub use backup::{backup, backup_with, folder_list};
pub use copy::{copy, copy_folder};
pub use reindex::update_db_from_archive;

use thiserror::Error;

/// Configuration errors raised before any network or storage side effect.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("option 'move_to_archive' given, but 'archive_folder' missing")]
    MissingArchiveFolder,
}

/// Filename of the metadata index inside the store root.
pub(crate) const INDEX_FILE: &str = "store.db";
/// Artifact suffix for stored messages.
pub(crate) const MESSAGE_SUFFIX: &str = ".eml";
