//! Rebuild the metadata index from an existing store tree

use std::fs;
use std::path::Path;

use anyhow::Result;
use log::{debug, error};

use crate::headers;
use crate::index::MetaIndex;
use crate::store::ContentStore;

use super::{INDEX_FILE, MESSAGE_SUFFIX};

/// Re-derive metadata for every artifact in the store.
///
/// Recovery path: walks the content store, parses each stored message and
/// rebuilds the index rows. Inserts are idempotent, so running this over
/// an index that is partially populated is safe. `mailbox` optionally
/// links every message to one mailbox. Unreadable or unparsable artifacts
/// are logged and skipped.
pub fn update_db_from_archive(store_path: &Path, mailbox: Option<&str>) -> Result<()> {
    let store = ContentStore::new(store_path, MESSAGE_SUFFIX)?;
    let index = MetaIndex::open(store_path.join(INDEX_FILE))?;
    let mailbox_id = match mailbox {
        Some(name) => Some(index.add_mailbox(name)?),
        None => None,
    };

    for path in store.walk() {
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) => {
                error!("{}: {}", path.display(), err);
                continue;
            }
        };
        let store_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = match headers::parse_message_meta(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                error!("{}: {}", path.display(), err);
                continue;
            }
        };
        debug!(
            "{}: message_id={}, date={:?}",
            store_id, meta.email_id, meta.date
        );

        let message_id =
            index.add_message(&store_id, &meta.email_id, meta.date, &meta.subject, mailbox_id)?;
        index.add_message_sender(message_id, &meta.sender)?;
        index.add_message_recipients(message_id, &meta.recipients)?;
    }
    Ok(())
}
