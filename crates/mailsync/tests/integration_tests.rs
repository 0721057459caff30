//! Integration tests for the mailsync crate
//!
//! These drive the backup engines end to end over the in-memory session.

use chrono::{Duration, Utc};
use mailsync::sync::backup_with;
use mailsync::{
    AddStatus, ClientOptions, ContentStore, InMemorySession, MailboxClient, MailboxJob, MetaIndex,
};
use tempfile::TempDir;

fn raw_message(n: u32) -> Vec<u8> {
    format!(
        "From: sender{n}@example.com\r\n\
To: recipient@example.com\r\n\
Subject: Message {n}\r\n\
Message-Id: <msg-{n}@example.com>\r\n\
Date: Wed, 04 Jun 2025 10:0{n}:00 +0000\r\n\
\r\n\
Body of message {n}\r\n"
    )
    .into_bytes()
}

fn test_job(name: &str) -> MailboxJob {
    let mut job = MailboxJob::default();
    job.name = name.to_string();
    job
}

fn client_for(session: &InMemorySession, name: &str) -> MailboxClient {
    MailboxClient::new(
        Box::new(session.clone()),
        name,
        ClientOptions::default(),
    )
    .unwrap()
}

#[test]
fn test_store_two_blobs_walk_yields_two() {
    let dir = TempDir::new().unwrap();
    let store = ContentStore::new(dir.path().join("cas"), ".eml").unwrap();

    let first = store.add(b"first message").unwrap();
    let second = store.add(b"second message").unwrap();
    assert_eq!(first.status, AddStatus::New);
    assert_eq!(second.status, AddStatus::New);
    assert_ne!(first.digest, second.digest);

    let paths: Vec<_> = store.walk().collect();
    assert_eq!(paths.len(), 2);
    assert!(paths.contains(&first.path));
    assert!(paths.contains(&second.path));
}

#[test]
fn test_folder_backup_indexes_three_messages() {
    let session = InMemorySession::new();
    session.add_folder("INBOX");
    for n in 1..=3 {
        session.add_message("INBOX", Some(Utc::now()), &raw_message(n));
    }
    let client = client_for(&session, "job");

    let dir = TempDir::new().unwrap();
    let store = ContentStore::new(dir.path().join("store"), ".eml").unwrap();
    let index = MetaIndex::open(dir.path().join("store").join("store.db")).unwrap();
    let mailbox_id = index.add_mailbox("job").unwrap();
    index.add_label("INBOX").unwrap();

    let mut sink =
        |meta: mailsync::MessageMeta| index.record_message(&meta, mailbox_id).map(|_| ());
    let (copied, found) = client
        .folder_backup("INBOX", &store, None, Some(&mut sink))
        .unwrap();
    assert_eq!((copied, found), (3, 3));

    let rows = index.messages().unwrap();
    assert_eq!(rows.len(), 3);
    // Every message is linked to the mailbox and carries the folder name
    // as a label.
    assert!(rows.iter().all(|row| row.mailbox.as_deref() == Some("job")));
    for row in &rows {
        let labels = index.get_message_labels(row.message_id).unwrap();
        assert_eq!(labels, vec!["INBOX".to_string()]);
    }
}

#[test]
fn test_incremental_pass_uses_stored_watermark() {
    let session = InMemorySession::new();
    session.add_folder("INBOX");
    for n in 1..=2 {
        session.add_message("INBOX", Some(Utc::now()), &raw_message(n));
    }
    let client = client_for(&session, "job");
    let job = test_job("job");

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store");

    // First pass: no watermark yet, the search is unbounded.
    backup_with(&client, &job, &store_path).unwrap();
    assert_eq!(session.last_search_since(), Some(None));

    let index = MetaIndex::open(store_path.join("store.db")).unwrap();
    let mailbox_id = index.add_mailbox("job").unwrap();
    let label_id = index.add_label("INBOX").unwrap();
    let watermark = index
        .get_snapshot_date(mailbox_id, label_id)
        .unwrap()
        .expect("first pass must set a watermark");
    let duplicates_before = index.duplicates().unwrap().len();
    drop(index);

    // Second pass with no new messages: the search starts one day before
    // the stored watermark.
    backup_with(&client, &job, &store_path).unwrap();
    assert_eq!(
        session.last_search_since(),
        Some(Some((watermark - Duration::days(1)).date_naive()))
    );

    let index = MetaIndex::open(store_path.join("store.db")).unwrap();
    assert_eq!(index.messages().unwrap().len(), 2);
    // Re-importing identical content never grows the duplicate view.
    assert!(index.duplicates().unwrap().len() >= duplicates_before);
    assert_eq!(index.duplicates().unwrap().len(), 0);
}

#[test]
fn test_failed_folder_keeps_watermark() {
    let session = InMemorySession::new();
    session.add_folder("INBOX");
    session.add_message("INBOX", Some(Utc::now()), &raw_message(1));
    let client = client_for(&session, "job");
    let job = test_job("job");

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store");

    backup_with(&client, &job, &store_path).unwrap();

    let index = MetaIndex::open(store_path.join("store.db")).unwrap();
    let mailbox_id = index.add_mailbox("job").unwrap();
    let label_id = index.add_label("INBOX").unwrap();
    let watermark = index.get_snapshot_date(mailbox_id, label_id).unwrap();
    assert!(watermark.is_some());
    drop(index);

    // Break the folder and run again: the pass fails and the watermark
    // stays exactly where it was.
    session.fail_search_in("INBOX");
    backup_with(&client, &job, &store_path).unwrap();

    let index = MetaIndex::open(store_path.join("store.db")).unwrap();
    assert_eq!(
        index.get_snapshot_date(mailbox_id, label_id).unwrap(),
        watermark
    );
}

#[test]
fn test_failed_folder_does_not_stop_siblings() {
    let session = InMemorySession::new();
    session.add_folder("Broken");
    session.add_folder("Works");
    session.add_message("Works", Some(Utc::now()), &raw_message(1));
    session.fail_search_in("Broken");
    let client = client_for(&session, "job");

    let mut job = test_job("job");
    job.folders = Some(vec!["Broken".to_string(), "Works".to_string()]);

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store");
    backup_with(&client, &job, &store_path).unwrap();

    let index = MetaIndex::open(store_path.join("store.db")).unwrap();
    assert_eq!(index.messages().unwrap().len(), 1);
    let mailbox_id = index.add_mailbox("job").unwrap();
    let works = index.add_label("Works").unwrap();
    let broken = index.add_label("Broken").unwrap();
    assert!(index.get_snapshot_date(mailbox_id, works).unwrap().is_some());
    assert!(index.get_snapshot_date(mailbox_id, broken).unwrap().is_none());
}

#[test]
fn test_store_only_backup_without_index() {
    let session = InMemorySession::new();
    session.add_folder("INBOX");
    session.add_message("INBOX", Some(Utc::now()), &raw_message(1));
    let client = client_for(&session, "job");

    let mut job = test_job("job");
    job.with_db = false;

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store");
    backup_with(&client, &job, &store_path).unwrap();

    let store = ContentStore::new(&store_path, ".eml").unwrap();
    assert_eq!(store.walk().count(), 1);
    assert!(!store_path.join("store.db").exists());
}

#[test]
fn test_provider_labels_recorded() {
    let session = InMemorySession::new().with_capability("X-GM-EXT-1");
    session.add_folder("Receipts");
    let uid = session.add_message("Receipts", Some(Utc::now()), &raw_message(1));
    session.set_labels(uid, &["Important", "Paid"]);
    let client = client_for(&session, "job");
    let job = test_job("job");

    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("store");
    backup_with(&client, &job, &store_path).unwrap();

    let index = MetaIndex::open(store_path.join("store.db")).unwrap();
    let rows = index.messages().unwrap();
    assert_eq!(rows.len(), 1);
    let mut labels = index.get_message_labels(rows[0].message_id).unwrap();
    labels.sort();
    // Folder name plus the provider labels.
    assert_eq!(
        labels,
        vec![
            "Important".to_string(),
            "Paid".to_string(),
            "Receipts".to_string()
        ]
    );
}
