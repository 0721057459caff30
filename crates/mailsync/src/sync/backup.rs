//! Snapshot-aware mailbox backup

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use log::{error, info};

use crate::index::MetaIndex;
use crate::job::MailboxJob;
use crate::session::{MailboxClient, MessageMeta};
use crate::store::ContentStore;

use super::{INDEX_FILE, MESSAGE_SUFFIX};

/// Back up a mailbox into the store rooted at `store_path`.
pub fn backup(job: &MailboxJob, store_path: &Path) -> Result<()> {
    let client = MailboxClient::open(job)?;
    backup_with(&client, job, store_path)
}

/// Back up through an already opened client.
///
/// With `with_db`, every folder pass feeds the metadata index and the
/// folder's snapshot watermark advances only when the pass completed
/// without error. The watermark is stamped at pass start, not pass end,
/// so messages arriving mid-pass are covered by the next run. A failed
/// folder is logged and skipped; its siblings still run.
pub fn backup_with(client: &MailboxClient, job: &MailboxJob, store_path: &Path) -> Result<()> {
    let store = ContentStore::new(store_path, MESSAGE_SUFFIX)?;

    if !job.with_db {
        return match &job.folders {
            Some(folders) => {
                for folder in folders {
                    if let Err(err) = client.folder_backup(folder, &store, None, None) {
                        error!("{}::{}: folder backup failed: {}", job.name, folder, err);
                    }
                }
                Ok(())
            }
            None => client.full_backup(&store, None, None),
        };
    }

    let index = MetaIndex::open(store_path.join(INDEX_FILE))?;
    let mailbox_id = index.add_mailbox(&job.name)?;
    let folders = match &job.folders {
        Some(folders) => folders.clone(),
        None => client.folders()?.into_iter().map(|f| f.name).collect(),
    };

    for folder in folders {
        let label_id = index.add_label(&folder)?;
        let since = if job.incremental {
            index.get_snapshot_date(mailbox_id, label_id)?
        } else {
            None
        };
        let pass_started = Utc::now();
        let mut sink = |meta: MessageMeta| index.record_message(&meta, mailbox_id).map(|_| ());
        match client.folder_backup(&folder, &store, since, Some(&mut sink)) {
            Ok((copied, found)) => {
                info!(
                    "{}::{}: backed up {}/{} messages",
                    job.name, folder, copied, found
                );
                index.set_snapshot(mailbox_id, label_id, pass_started)?;
            }
            Err(err) => {
                // Watermark withheld; the next run re-covers the window.
                error!("{}::{}: folder backup failed: {}", job.name, folder, err);
            }
        }
    }
    Ok(())
}

/// Print the folders a job can see. Read-only.
pub fn folder_list(job: &MailboxJob) -> Result<()> {
    let client = MailboxClient::open(job)?;
    for folder in client.folders()? {
        println!("{}::{}", job.name, folder.name);
    }
    Ok(())
}
