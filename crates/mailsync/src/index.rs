//! SQLite metadata index for stored messages
//!
//! Keeps mailboxes, labels, addresses, subjects and message links in a
//! relational file next to the content store, plus a per-(mailbox, label)
//! snapshot watermark that drives incremental backup. Every mutation is
//! idempotent under ignore-on-conflict unique constraints, so re-running a
//! pass never duplicates rows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use rusqlite_migration::{M, Migrations};

use crate::session::MessageMeta;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE mailbox (
            mailbox_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            UNIQUE(name) ON CONFLICT IGNORE);

        CREATE TABLE address (
            address_id INTEGER PRIMARY KEY,
            address TEXT NOT NULL,
            UNIQUE(address) ON CONFLICT IGNORE);
        CREATE UNIQUE INDEX idx_address_value ON address(address);

        CREATE TABLE label (
            label_id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            UNIQUE(name) ON CONFLICT IGNORE);
        CREATE UNIQUE INDEX idx_label_name ON label(name);
        INSERT OR IGNORE INTO label(name) VALUES ('INBOX');

        CREATE TABLE subject (
            subject_id INTEGER PRIMARY KEY,
            text TEXT NOT NULL,
            UNIQUE(text) ON CONFLICT IGNORE);
        CREATE UNIQUE INDEX idx_subject_text ON subject(text);

        CREATE TABLE message (
            message_id INTEGER PRIMARY KEY,
            store_id TEXT NOT NULL,
            email_id TEXT,
            date TEXT,
            subject_id INTEGER,
            FOREIGN KEY(subject_id) REFERENCES subject(subject_id),
            UNIQUE(store_id) ON CONFLICT IGNORE);
        CREATE INDEX idx_message_store ON message(store_id);

        CREATE TABLE message_mailbox (
            message_id INTEGER,
            mailbox_id INTEGER,
            FOREIGN KEY(message_id) REFERENCES message(message_id),
            FOREIGN KEY(mailbox_id) REFERENCES mailbox(mailbox_id),
            UNIQUE(message_id, mailbox_id) ON CONFLICT IGNORE);
        CREATE INDEX idx_message_mailbox_msg ON message_mailbox(message_id);
        CREATE INDEX idx_message_mailbox_mb ON message_mailbox(mailbox_id);

        CREATE TABLE message_label (
            message_id INTEGER NOT NULL,
            label_id INTEGER NOT NULL,
            FOREIGN KEY(message_id) REFERENCES message(message_id),
            FOREIGN KEY(label_id) REFERENCES label(label_id),
            UNIQUE(message_id, label_id) ON CONFLICT IGNORE);
        CREATE INDEX idx_message_label_msg ON message_label(message_id);
        CREATE INDEX idx_message_label_label ON message_label(label_id);

        CREATE TABLE message_sender (
            message_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            FOREIGN KEY(message_id) REFERENCES message(message_id),
            FOREIGN KEY(address_id) REFERENCES address(address_id),
            UNIQUE(message_id, address_id) ON CONFLICT IGNORE);
        CREATE INDEX idx_message_sender_msg ON message_sender(message_id);
        CREATE INDEX idx_message_sender_addr ON message_sender(address_id);

        CREATE TABLE message_recipient (
            message_id INTEGER NOT NULL,
            address_id INTEGER NOT NULL,
            FOREIGN KEY(message_id) REFERENCES message(message_id),
            FOREIGN KEY(address_id) REFERENCES address(address_id),
            UNIQUE(message_id, address_id) ON CONFLICT IGNORE);
        CREATE INDEX idx_message_recipient_msg ON message_recipient(message_id);
        CREATE INDEX idx_message_recipient_addr ON message_recipient(address_id);

        CREATE TABLE snapshot (
            snapshot_id INTEGER PRIMARY KEY,
            mailbox_id INTEGER NOT NULL,
            label_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            FOREIGN KEY(mailbox_id) REFERENCES mailbox(mailbox_id),
            FOREIGN KEY(label_id) REFERENCES label(label_id),
            UNIQUE(mailbox_id, label_id) ON CONFLICT REPLACE);
        CREATE INDEX idx_snapshot_mailbox ON snapshot(mailbox_id);

        CREATE VIEW v_messages AS
        SELECT
            msg.message_id,
            msg.email_id,
            msg.store_id,
            msg.date,
            mb.name "mailbox",
            addr_send.address "sender",
            addr_rcpt.address "recipient",
            subject.text "subject"
        FROM message msg
        JOIN message_sender send USING (message_id)
        JOIN message_recipient rcpt USING (message_id)
        JOIN subject USING (subject_id)
        JOIN address addr_send ON addr_send.address_id = send.address_id
        JOIN address addr_rcpt ON addr_rcpt.address_id = rcpt.address_id
        LEFT OUTER JOIN message_mailbox mm USING (message_id)
        LEFT OUTER JOIN mailbox mb ON mb.mailbox_id = mm.mailbox_id;

        CREATE VIEW v_duplicates AS
        SELECT DISTINCT
            msg.message_id,
            msg.email_id,
            msg.store_id,
            msg.date
        FROM message msg
        INNER JOIN message dup
        ON msg.email_id = dup.email_id
            AND msg.date = dup.date
            AND msg.store_id <> dup.store_id
        ORDER BY msg.date, msg.email_id, msg.message_id;
        "#,
    )])
}

/// Lookup-table ids resolved so far, owned by the index instance.
///
/// Entries are only added after the transaction that created the row has
/// committed, so a rollback can never leave a stale id cached.
#[derive(Debug, Default)]
struct IdCache {
    mailboxes: HashMap<String, i64>,
    labels: HashMap<String, i64>,
    addresses: HashMap<String, i64>,
    subjects: HashMap<String, i64>,
}

/// One row of the denormalized message listing view.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: i64,
    pub email_id: Option<String>,
    pub store_id: String,
    pub date: Option<String>,
    pub mailbox: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
}

/// One row of the duplicate-detection view: messages sharing
/// `(email_id, date)` but stored under distinct digests.
#[derive(Debug, Clone)]
pub struct DuplicateRow {
    pub message_id: i64,
    pub email_id: Option<String>,
    pub store_id: String,
    pub date: Option<String>,
}

/// Transactional metadata index backed by SQLite.
pub struct MetaIndex {
    conn: Mutex<Connection>,
    ids: Mutex<IdCache>,
}

impl MetaIndex {
    /// Open (or create) the index at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open index at {:?}", path.as_ref()))?;

        // WAL keeps readers unblocked during a sync pass; foreign keys are
        // required for the association tables to stay consistent.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run index migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
            ids: Mutex::new(IdCache::default()),
        })
    }

    /// Look up or create a mailbox by name.
    pub fn add_mailbox(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.ids.lock().unwrap().mailboxes.get(name) {
            return Ok(*id);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = mailbox_id_tx(&tx, name)?;
        tx.commit()?;
        self.ids
            .lock()
            .unwrap()
            .mailboxes
            .insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up or create a label by name.
    pub fn add_label(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.ids.lock().unwrap().labels.get(name) {
            return Ok(*id);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = label_id_tx(&tx, name)?;
        tx.commit()?;
        self.ids.lock().unwrap().labels.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up or create an address; addresses are stored lower-cased.
    pub fn add_address(&self, address: &str) -> Result<i64> {
        let address = address.to_lowercase();
        if let Some(id) = self.ids.lock().unwrap().addresses.get(&address) {
            return Ok(*id);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = address_id_tx(&tx, &address)?;
        tx.commit()?;
        self.ids.lock().unwrap().addresses.insert(address, id);
        Ok(id)
    }

    /// Look up or create a subject.
    pub fn add_subject(&self, subject: &str) -> Result<i64> {
        if let Some(id) = self.ids.lock().unwrap().subjects.get(subject) {
            return Ok(*id);
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = subject_id_tx(&tx, subject)?;
        tx.commit()?;
        self.ids
            .lock()
            .unwrap()
            .subjects
            .insert(subject.to_string(), id);
        Ok(id)
    }

    /// Upsert a message by its store digest and return its row id.
    ///
    /// Calling this twice with the same `store_id` returns the same id
    /// without creating a second row.
    pub fn add_message(
        &self,
        store_id: &str,
        email_id: &str,
        date: Option<DateTime<Utc>>,
        subject: &str,
        mailbox_id: Option<i64>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let subject_id = subject_id_tx(&tx, subject)?;
        let message_id = insert_message_tx(&tx, store_id, email_id, date, subject_id)?;
        if let Some(mailbox_id) = mailbox_id {
            assign_mailbox_tx(&tx, message_id, mailbox_id)?;
        }
        tx.commit()?;
        Ok(message_id)
    }

    /// Link a message to a mailbox.
    pub fn assign_message_to_mailbox(&self, message_id: i64, mailbox_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        assign_mailbox_tx(&tx, message_id, mailbox_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Add labels to a message, creating unknown labels on the fly.
    pub fn add_message_labels(&self, message_id: i64, labels: &[String]) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            for label in labels {
                let label_id = self.cached_label(&tx, &mut pending, label)?;
                link_label_tx(&tx, message_id, label_id)?;
            }
            tx.commit()?;
        }
        self.ids.lock().unwrap().labels.extend(pending);
        Ok(())
    }

    /// Reconcile a message's label set to exactly the given names.
    pub fn update_message_labels(&self, message_id: i64, labels: &[&str]) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let mut keep = Vec::new();
            for label in labels {
                let label_id = self.cached_label(&tx, &mut pending, label)?;
                keep.push(label_id);
                link_label_tx(&tx, message_id, label_id)?;
            }
            for label_id in message_label_ids_tx(&tx, message_id)? {
                if !keep.contains(&label_id) {
                    tx.execute(
                        "DELETE FROM message_label WHERE message_id = ? AND label_id = ?",
                        params![message_id, label_id],
                    )?;
                }
            }
            tx.commit()?;
        }
        self.ids.lock().unwrap().labels.extend(pending);
        Ok(())
    }

    /// Names of the labels currently attached to a message.
    pub fn get_message_labels(&self, message_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT label.name FROM message_label JOIN label USING (label_id)
             WHERE message_id = ?",
        )?;
        let labels = stmt
            .query_map([message_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    /// Add sender addresses to a message.
    pub fn add_message_sender(&self, message_id: i64, addresses: &[String]) -> Result<()> {
        self.link_addresses(message_id, addresses, "message_sender")
    }

    /// Add recipient addresses to a message.
    pub fn add_message_recipients(&self, message_id: i64, addresses: &[String]) -> Result<()> {
        self.link_addresses(message_id, addresses, "message_recipient")
    }

    fn link_addresses(&self, message_id: i64, addresses: &[String], table: &str) -> Result<()> {
        let mut pending = Vec::new();
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            for address in addresses {
                let address_id = self.cached_address(&tx, &mut pending, address)?;
                link_address_tx(&tx, table, message_id, address_id)?;
            }
            tx.commit()?;
        }
        self.ids.lock().unwrap().addresses.extend(pending);
        Ok(())
    }

    /// Record one backed-up message: row, mailbox link, labels, senders
    /// and recipients, all inside a single transaction.
    pub fn record_message(&self, meta: &MessageMeta, mailbox_id: i64) -> Result<i64> {
        let mut pending_labels = Vec::new();
        let mut pending_addrs = Vec::new();
        let mut pending_subjects = Vec::new();
        let message_id = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            let subject_id = self.cached_subject(&tx, &mut pending_subjects, &meta.subject)?;
            let message_id =
                insert_message_tx(&tx, &meta.store_id, &meta.email_id, meta.date, subject_id)?;
            assign_mailbox_tx(&tx, message_id, mailbox_id)?;
            for label in &meta.labels {
                let label_id = self.cached_label(&tx, &mut pending_labels, label)?;
                link_label_tx(&tx, message_id, label_id)?;
            }
            for address in &meta.sender {
                let address_id = self.cached_address(&tx, &mut pending_addrs, address)?;
                link_address_tx(&tx, "message_sender", message_id, address_id)?;
            }
            for address in &meta.recipients {
                let address_id = self.cached_address(&tx, &mut pending_addrs, address)?;
                link_address_tx(&tx, "message_recipient", message_id, address_id)?;
            }
            tx.commit()?;
            message_id
        };
        let mut ids = self.ids.lock().unwrap();
        ids.labels.extend(pending_labels);
        ids.addresses.extend(pending_addrs);
        ids.subjects.extend(pending_subjects);
        Ok(message_id)
    }

    /// Set the snapshot watermark for a (mailbox, label) pair, replacing
    /// any previous value.
    pub fn set_snapshot(
        &self,
        mailbox_id: i64,
        label_id: i64,
        date: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshot(mailbox_id, label_id, date) VALUES (?, ?, ?)",
            params![mailbox_id, label_id, date.to_rfc3339()],
        )?;
        Ok(())
    }

    /// The stored watermark for a (mailbox, label) pair, if any.
    pub fn get_snapshot_date(
        &self,
        mailbox_id: i64,
        label_id: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let date: Option<String> = conn
            .query_row(
                "SELECT date FROM snapshot WHERE mailbox_id = ? AND label_id = ?",
                params![mailbox_id, label_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(date.and_then(|value| match DateTime::parse_from_rfc3339(&value) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(err) => {
                warn!("unparseable snapshot date '{}': {}", value, err);
                None
            }
        }))
    }

    /// Delete the watermark for one label, or all of a mailbox's
    /// watermarks when `label_id` is `None`.
    pub fn delete_snapshot(&self, mailbox_id: i64, label_id: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match label_id {
            Some(label_id) => {
                conn.execute(
                    "DELETE FROM snapshot WHERE mailbox_id = ? AND label_id = ?",
                    params![mailbox_id, label_id],
                )?;
            }
            None => {
                conn.execute("DELETE FROM snapshot WHERE mailbox_id = ?", [mailbox_id])?;
            }
        }
        Ok(())
    }

    /// Denormalized message listing.
    pub fn messages(&self) -> Result<Vec<MessageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id, email_id, store_id, date, mailbox, sender, recipient, subject
             FROM v_messages",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MessageRow {
                    message_id: row.get(0)?,
                    email_id: row.get(1)?,
                    store_id: row.get(2)?,
                    date: row.get(3)?,
                    mailbox: row.get(4)?,
                    sender: row.get(5)?,
                    recipient: row.get(6)?,
                    subject: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Messages sharing `(email_id, date)` but stored under different
    /// digests, i.e. duplicates introduced by re-imports.
    pub fn duplicates(&self) -> Result<Vec<DuplicateRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT message_id, email_id, store_id, date FROM v_duplicates")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DuplicateRow {
                    message_id: row.get(0)?,
                    email_id: row.get(1)?,
                    store_id: row.get(2)?,
                    date: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn cached_label(
        &self,
        tx: &Transaction,
        pending: &mut Vec<(String, i64)>,
        name: &str,
    ) -> Result<i64> {
        if let Some(id) = self.ids.lock().unwrap().labels.get(name) {
            return Ok(*id);
        }
        let id = label_id_tx(tx, name)?;
        pending.push((name.to_string(), id));
        Ok(id)
    }

    fn cached_address(
        &self,
        tx: &Transaction,
        pending: &mut Vec<(String, i64)>,
        address: &str,
    ) -> Result<i64> {
        let address = address.to_lowercase();
        if let Some(id) = self.ids.lock().unwrap().addresses.get(&address) {
            return Ok(*id);
        }
        let id = address_id_tx(tx, &address)?;
        pending.push((address, id));
        Ok(id)
    }

    fn cached_subject(
        &self,
        tx: &Transaction,
        pending: &mut Vec<(String, i64)>,
        subject: &str,
    ) -> Result<i64> {
        if let Some(id) = self.ids.lock().unwrap().subjects.get(subject) {
            return Ok(*id);
        }
        let id = subject_id_tx(tx, subject)?;
        pending.push((subject.to_string(), id));
        Ok(id)
    }
}

fn mailbox_id_tx(tx: &Transaction, name: &str) -> Result<i64> {
    tx.execute("INSERT OR IGNORE INTO mailbox(name) VALUES (?)", [name])?;
    let id = tx.query_row(
        "SELECT mailbox_id FROM mailbox WHERE name = ?",
        [name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn label_id_tx(tx: &Transaction, name: &str) -> Result<i64> {
    tx.execute("INSERT OR IGNORE INTO label(name) VALUES (?)", [name])?;
    let id = tx.query_row(
        "SELECT label_id FROM label WHERE name = ?",
        [name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn address_id_tx(tx: &Transaction, address: &str) -> Result<i64> {
    tx.execute("INSERT OR IGNORE INTO address(address) VALUES (?)", [address])?;
    let id = tx.query_row(
        "SELECT address_id FROM address WHERE address = ?",
        [address],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn subject_id_tx(tx: &Transaction, subject: &str) -> Result<i64> {
    tx.execute("INSERT OR IGNORE INTO subject(text) VALUES (?)", [subject])?;
    let id = tx.query_row(
        "SELECT subject_id FROM subject WHERE text = ?",
        [subject],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn insert_message_tx(
    tx: &Transaction,
    store_id: &str,
    email_id: &str,
    date: Option<DateTime<Utc>>,
    subject_id: i64,
) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO message(store_id, email_id, date, subject_id)
         VALUES (?, ?, ?, ?)",
        params![store_id, email_id, date.map(|d| d.to_rfc3339()), subject_id],
    )?;
    let id = tx.query_row(
        "SELECT message_id FROM message WHERE store_id = ?",
        [store_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn assign_mailbox_tx(tx: &Transaction, message_id: i64, mailbox_id: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO message_mailbox(message_id, mailbox_id) VALUES (?, ?)",
        params![message_id, mailbox_id],
    )?;
    Ok(())
}

fn link_label_tx(tx: &Transaction, message_id: i64, label_id: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO message_label(message_id, label_id) VALUES (?, ?)",
        params![message_id, label_id],
    )?;
    Ok(())
}

fn link_address_tx(
    tx: &Transaction,
    table: &str,
    message_id: i64,
    address_id: i64,
) -> Result<()> {
    tx.execute(
        &format!("INSERT OR IGNORE INTO {table}(message_id, address_id) VALUES (?, ?)"),
        params![message_id, address_id],
    )?;
    Ok(())
}

fn message_label_ids_tx(tx: &Transaction, message_id: i64) -> Result<Vec<i64>> {
    let mut stmt = tx.prepare("SELECT label_id FROM message_label WHERE message_id = ?")?;
    let ids = stmt
        .query_map([message_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
