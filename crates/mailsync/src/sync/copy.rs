//! Mailbox-to-mailbox copy, one-shot and live

use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::job::MailboxJob;
use crate::session::{MailboxClient, WATCH_MAX_DURATION, WATCH_TIMEOUT, WatchStatus};

use super::JobError;

/// Delay between reconnect attempts in live mode.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Copy messages from one mailbox to another.
///
/// `idle` switches to live mode: INBOX only, an initial copy, then a copy
/// after every push notification, reconnecting on transport failure.
/// Configuration is validated before anything touches the network.
pub fn copy(source: &MailboxJob, destination: &MailboxJob, idle: bool) -> Result<()> {
    let archive_template = if source.move_to_archive {
        match &source.archive_folder {
            Some(folder) => Some(folder.clone()),
            None => return Err(JobError::MissingArchiveFolder.into()),
        }
    } else {
        None
    };

    if idle {
        // Live mode covers INBOX only for now.
        idle_copy(source, "INBOX", destination, archive_template.as_deref())
    } else {
        let from = MailboxClient::open(source)?;
        let to = MailboxClient::open(destination)?;
        let folders = source
            .folders
            .clone()
            .unwrap_or_else(|| vec!["INBOX".to_string()]);
        for folder in &folders {
            copy_folder(&from, &to, folder, archive_template.as_deref())?;
        }
        Ok(())
    }
}

/// Copy one folder between two open clients.
pub fn copy_folder(
    from: &MailboxClient,
    to: &MailboxClient,
    folder: &str,
    archive_template: Option<&str>,
) -> Result<usize> {
    let copied = from.copy_folder_to(to, folder, archive_template)?;
    info!(
        "{}::{}: copied {} messages to {}",
        from.job_name(),
        folder,
        copied,
        to.job_name()
    );
    Ok(copied)
}

/// Live watch-copy loop. Reconnects forever; the delay keeps a hard-down
/// server from being hammered in a tight loop.
fn idle_copy(
    source: &MailboxJob,
    folder: &str,
    destination: &MailboxJob,
    archive_template: Option<&str>,
) -> Result<()> {
    loop {
        match live_session(source, folder, destination, archive_template) {
            // The watch expired cleanly; refresh the session and go on.
            Ok(()) => {}
            Err(err) => {
                warn!("{}::{}: connection lost: {}", source.name, folder, err);
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

/// One session's worth of live copying: copy once, then copy again on
/// every notification until the watch ends.
fn live_session(
    source: &MailboxJob,
    folder: &str,
    destination: &MailboxJob,
    archive_template: Option<&str>,
) -> Result<()> {
    let from = MailboxClient::open(source)?;
    copy_to_destination(&from, folder, destination, archive_template)?;
    let mut watch = from.watch_folder(folder, WATCH_TIMEOUT, WATCH_MAX_DURATION);
    loop {
        match watch.next_notification()? {
            WatchStatus::Notified => {
                copy_to_destination(&from, folder, destination, archive_template)?;
            }
            WatchStatus::Ended => return Ok(()),
        }
    }
}

fn copy_to_destination(
    from: &MailboxClient,
    folder: &str,
    destination: &MailboxJob,
    archive_template: Option<&str>,
) -> Result<()> {
    let to = MailboxClient::open(destination)?;
    copy_folder(from, &to, folder, archive_template)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_to_archive_requires_archive_folder() {
        let mut source = MailboxJob::default();
        source.name = "src".to_string();
        source.move_to_archive = true;
        let destination = MailboxJob::default();

        // Fails before any connection is attempted.
        let err = copy(&source, &destination, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<JobError>(),
            Some(JobError::MissingArchiveFolder)
        ));
    }
}
