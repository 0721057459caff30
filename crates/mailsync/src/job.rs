//! Per-mailbox job configuration
//!
//! A jobs file is a JSON map of job name to options. Everything except
//! the credentials has a sensible default, so a minimal job is just
//! `{"server": "...", "username": "...", "password": "..."}`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// A configured sync source or destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailboxJob {
    /// Job name; filled in from the jobs-file key.
    #[serde(skip)]
    pub name: String,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub tls_check_hostname: bool,
    pub tls_verify_cert: bool,
    /// Explicit folder list; all discovered folders when absent.
    pub folders: Option<Vec<String>>,
    /// Folder type flags to skip (e.g. "noselect", "all").
    pub ignore_folder_flags: Vec<String>,
    /// Folder name patterns to skip (anchored regular expressions).
    pub ignore_folder_names: Vec<String>,
    pub delete_after_export: bool,
    /// Messages are journal envelopes; unwrap them before storing.
    pub exchange_journal: bool,
    /// Provider trash folder to clear after a backup pass.
    pub trash_folder: Option<String>,
    /// Destination for messages that fail journal unwrapping.
    pub error_folder: Option<String>,
    pub move_to_archive: bool,
    /// strftime-style template for the archive folder name.
    pub archive_folder: Option<String>,
    /// Maintain the metadata index during backup.
    pub with_db: bool,
    /// Resume from the stored snapshot watermark.
    pub incremental: bool,
}

impl Default for MailboxJob {
    fn default() -> Self {
        Self {
            name: String::new(),
            server: "localhost".to_string(),
            port: 993,
            username: String::new(),
            password: String::new(),
            tls: true,
            tls_check_hostname: true,
            tls_verify_cert: true,
            folders: None,
            ignore_folder_flags: Vec::new(),
            ignore_folder_names: Vec::new(),
            delete_after_export: false,
            exchange_journal: false,
            trash_folder: None,
            error_folder: None,
            move_to_archive: false,
            archive_folder: None,
            with_db: true,
            incremental: true,
        }
    }
}

/// Load all jobs from a JSON jobs file.
pub fn load_jobs(path: &Path) -> Result<Vec<MailboxJob>> {
    let table: BTreeMap<String, MailboxJob> = config::load_json_file(path)
        .with_context(|| format!("Failed to load jobs from {}", path.display()))?;
    Ok(table
        .into_iter()
        .map(|(name, mut job)| {
            job.name = name;
            job
        })
        .collect())
}

/// Find a job by name, case-insensitively.
pub fn find_job<'a>(jobs: &'a [MailboxJob], name: &str) -> Option<&'a MailboxJob> {
    jobs.iter().find(|job| job.name.eq_ignore_ascii_case(name))
}
