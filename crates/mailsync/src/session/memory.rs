//! In-memory transport session for tests
//!
//! Folders, messages, capabilities and idle outcomes are scripted up
//! front; the session shares its state across clones so a test can keep a
//! handle for assertions after the client has taken ownership.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};

use super::{FetchedMessage, Folder, IdleOutcome, MailSession};

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: u32,
    date: Option<DateTime<Utc>>,
    body: Vec<u8>,
    deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct MemFolder {
    flags: Vec<String>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct MemState {
    folders: Vec<(String, MemFolder)>,
    capabilities: Vec<String>,
    selected: Option<String>,
    next_uid: u32,
    idle_script: VecDeque<IdleOutcome>,
    labels: Vec<(u32, Vec<String>)>,
    fail_search: Option<String>,
    last_search_since: Option<Option<NaiveDate>>,
}

impl MemState {
    fn folder(&self, name: &str) -> Option<&MemFolder> {
        self.folders
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    fn folder_mut(&mut self, name: &str) -> Option<&mut MemFolder> {
        self.folders
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }

    fn selected_mut(&mut self) -> Result<&mut MemFolder> {
        let Some(name) = self.selected.clone() else {
            bail!("no folder selected");
        };
        self.folder_mut(&name)
            .ok_or_else(|| anyhow::anyhow!("selected folder '{}' vanished", name))
    }
}

/// Scriptable in-memory session shared across clones.
#[derive(Clone, Default)]
pub struct InMemorySession {
    state: Arc<Mutex<MemState>>,
}

impl InMemorySession {
    pub fn new() -> Self {
        let session = Self::default();
        session.state.lock().unwrap().next_uid = 1;
        session
    }

    pub fn with_capability(self, capability: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .capabilities
            .push(capability.to_string());
        self
    }

    pub fn add_folder(&self, name: &str) {
        self.add_folder_with_flags(name, &[]);
    }

    pub fn add_folder_with_flags(&self, name: &str, flags: &[&str]) {
        let mut state = self.state.lock().unwrap();
        if state.folder(name).is_none() {
            state.folders.push((
                name.to_string(),
                MemFolder {
                    flags: flags.iter().map(|f| f.to_string()).collect(),
                    messages: Vec::new(),
                },
            ));
        }
    }

    pub fn add_message(&self, folder: &str, date: Option<DateTime<Utc>>, body: &[u8]) -> u32 {
        let mut state = self.state.lock().unwrap();
        let uid = state.next_uid;
        state.next_uid += 1;
        if state.folder(folder).is_none() {
            state.folders.push((folder.to_string(), MemFolder::default()));
        }
        state
            .folder_mut(folder)
            .expect("folder just ensured")
            .messages
            .push(StoredMessage {
                uid,
                date,
                body: body.to_vec(),
                deleted: false,
            });
        uid
    }

    pub fn set_labels(&self, uid: u32, labels: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .labels
            .push((uid, labels.iter().map(|l| l.to_string()).collect()));
    }

    /// Queue the outcome of the next idle wait.
    pub fn script_idle(&self, outcome: IdleOutcome) {
        self.state.lock().unwrap().idle_script.push_back(outcome);
    }

    /// Make searches fail while the given folder is selected.
    pub fn fail_search_in(&self, folder: &str) {
        self.state.lock().unwrap().fail_search = Some(folder.to_string());
    }

    /// Messages currently in a folder (zero for unknown folders).
    pub fn message_count(&self, folder: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .folder(folder)
            .map(|f| f.messages.iter().filter(|m| !m.deleted).count())
            .unwrap_or(0)
    }

    /// The `since` bound of the most recent search, if any search ran.
    pub fn last_search_since(&self) -> Option<Option<NaiveDate>> {
        self.state.lock().unwrap().last_search_since
    }
}

impl MailSession for InMemorySession {
    fn capabilities(&mut self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().capabilities.clone())
    }

    fn list_folders(&mut self) -> Result<Vec<Folder>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .folders
            .iter()
            .map(|(name, folder)| Folder {
                name: name.clone(),
                flags: folder.flags.clone(),
            })
            .collect())
    }

    fn select_folder(&mut self, folder: &str, _readonly: bool) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let Some(selected) = state.folder(folder) else {
            bail!("no such folder: {}", folder);
        };
        let exists = selected.messages.len() as u32;
        state.selected = Some(folder.to_string());
        Ok(exists)
    }

    fn create_folder(&mut self, folder: &str) -> Result<()> {
        self.add_folder(folder);
        Ok(())
    }

    fn folder_exists(&mut self, folder: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().folder(folder).is_some())
    }

    fn unselect_folder(&mut self) -> Result<()> {
        self.state.lock().unwrap().selected = None;
        Ok(())
    }

    fn search(&mut self, since: Option<NaiveDate>) -> Result<Vec<u32>> {
        let mut state = self.state.lock().unwrap();
        state.last_search_since = Some(since);
        if state.selected.is_some() && state.fail_search == state.selected {
            bail!("search failed");
        }
        let folder = state.selected_mut()?;
        Ok(folder
            .messages
            .iter()
            .filter(|message| !message.deleted)
            .filter(|message| match (since, message.date) {
                (Some(bound), Some(date)) => date.date_naive() >= bound,
                _ => true,
            })
            .map(|message| message.uid)
            .collect())
    }

    fn fetch_messages(&mut self, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        let mut state = self.state.lock().unwrap();
        let folder = state.selected_mut()?;
        Ok(folder
            .messages
            .iter()
            .filter(|message| uids.contains(&message.uid))
            .map(|message| FetchedMessage {
                uid: message.uid,
                date: message.date,
                body: message.body.clone(),
            })
            .collect())
    }

    fn append(&mut self, folder: &str, body: &[u8], date: Option<DateTime<Utc>>) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.folder(folder).is_none() {
                bail!("no such folder: {}", folder);
            }
        }
        self.add_message(folder, date, body);
        Ok(())
    }

    fn delete_messages(&mut self, uids: &[u32]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let folder = state.selected_mut()?;
        for message in &mut folder.messages {
            if uids.contains(&message.uid) {
                message.deleted = true;
            }
        }
        Ok(())
    }

    fn expunge(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let folder = state.selected_mut()?;
        folder.messages.retain(|message| !message.deleted);
        Ok(())
    }

    fn move_message(&mut self, uid: u32, folder: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let source = state.selected_mut()?;
        let Some(position) = source.messages.iter().position(|m| m.uid == uid) else {
            bail!("no such message: {}", uid);
        };
        let message = source.messages.remove(position);
        let Some(target) = state.folder_mut(folder) else {
            bail!("no such folder: {}", folder);
        };
        target.messages.push(message);
        Ok(())
    }

    fn fetch_labels(&mut self, uid: u32) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .labels
            .iter()
            .find(|(id, _)| *id == uid)
            .map(|(_, labels)| labels.clone())
            .unwrap_or_default())
    }

    fn idle_wait(&mut self, _timeout: Duration) -> Result<IdleOutcome> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .idle_script
            .pop_front()
            .unwrap_or(IdleOutcome::TimedOut))
    }

    fn logout(&mut self) -> Result<()> {
        Ok(())
    }
}
