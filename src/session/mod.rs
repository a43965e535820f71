//! Session module - conversation state and persistence
//!
//! Sessions are cached in memory behind a `tokio::sync::RwLock` and optionally
//! persisted as one pretty-printed JSON file per session. Writes go through a
//! temp file and a rename, so a crash mid-save leaves the previous version.
//!
//! # Example
//!
//! ```
//! use aisbot::session::{Message, SessionManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SessionManager::new_memory();
//!     let mut session = manager.get_or_create("telegram:chat123").await.unwrap();
//!     session.add_message(Message::user("Hello!")).unwrap();
//!     manager.save(&session).await.unwrap();
//! }
//! ```

mod types;

pub use types::{Message, ProcessedEnvelope, Role, Session, ToolCall, PROCESSED_LEDGER_CAPACITY};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::Config;
use crate::error::{AisbotError, Result};

/// Owns every session the agent loop works on.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    storage_path: Option<PathBuf>,
}

impl SessionManager {
    /// Create a session manager persisting to `~/.aisbot/sessions`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_path(Config::dir().join("sessions"))
    }

    /// Create a session manager without persistence.
    pub fn new_memory() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: None,
        }
    }

    /// Create a session manager persisting to `path`.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(path),
        })
    }

    fn file_for(&self, key: &str) -> Option<PathBuf> {
        self.storage_path
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", sanitize_key(key))))
    }

    async fn load_from_disk(&self, key: &str) -> Result<Option<Session>> {
        let Some(file_path) = self.file_for(key) else {
            return Ok(None);
        };
        if !file_path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&file_path).await?;
        let session: Session = serde_json::from_str(&content)?;
        Ok(Some(session))
    }

    /// Get an existing session or create an empty one.
    ///
    /// Sessions are created lazily in memory; nothing is written until
    /// [`save`](Self::save).
    pub async fn get_or_create(&self, key: &str) -> Result<Session> {
        if let Some(session) = self.get(key).await? {
            return Ok(session);
        }
        let session = Session::new(key);
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(key.to_string())
            .or_insert(session)
            .clone())
    }

    /// Get a session by key without creating it.
    pub async fn get(&self, key: &str) -> Result<Option<Session>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                return Ok(Some(session.clone()));
            }
        }

        match self.load_from_disk(key).await? {
            Some(session) => {
                let mut sessions = self.sessions.write().await;
                Ok(Some(
                    sessions
                        .entry(key.to_string())
                        .or_insert(session)
                        .clone(),
                ))
            }
            None => Ok(None),
        }
    }

    /// Persist a session and refresh the in-memory copy.
    ///
    /// # Errors
    /// Returns `AisbotError::Session` when the file cannot be written. The
    /// in-memory copy is only replaced after the write succeeded.
    pub async fn save(&self, session: &Session) -> Result<()> {
        if let Some(file_path) = self.file_for(&session.key) {
            let content = serde_json::to_string_pretty(session)?;
            let tmp = file_path.with_extension("json.tmp");
            tokio::fs::write(&tmp, content)
                .await
                .map_err(|e| AisbotError::Session(format!("write {}: {}", tmp.display(), e)))?;
            tokio::fs::rename(&tmp, &file_path).await.map_err(|e| {
                AisbotError::Session(format!("rename {}: {}", file_path.display(), e))
            })?;
            debug!(session = %session.key, messages = session.messages.len(), "Session saved");
        }

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.key.clone(), session.clone());
        Ok(())
    }

    /// Delete a session from both memory and disk.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.sessions.write().await.remove(key);
        if let Some(file_path) = self.file_for(key) {
            if file_path.exists() {
                tokio::fs::remove_file(&file_path).await?;
            }
        }
        Ok(())
    }

    /// List all session keys known in memory or on disk, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.sessions.read().await.keys().cloned().collect();

        if let Some(ref storage_path) = self.storage_path {
            let mut dir_entries = tokio::fs::read_dir(storage_path).await?;
            while let Some(entry) = dir_entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "json") {
                    if let Ok(content) = tokio::fs::read_to_string(&path).await {
                        if let Ok(session) = serde_json::from_str::<Session>(&content) {
                            if !keys.contains(&session.key) {
                                keys.push(session.key);
                            }
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Check if a session exists in memory or on disk.
    pub async fn exists(&self, key: &str) -> bool {
        if self.sessions.read().await.contains_key(key) {
            return true;
        }
        self.file_for(key).is_some_and(|p| p.exists())
    }

    /// Number of sessions held in memory.
    pub async fn cache_size(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new_memory()
    }
}

/// Percent-encode characters that are unsafe in filenames.
///
/// `%` itself is escaped so distinct keys never share a file.
fn sanitize_key(key: &str) -> String {
    let mut result = String::with_capacity(key.len() * 3);
    for c in key.chars() {
        match c {
            '/' => result.push_str("%2F"),
            '\\' => result.push_str("%5C"),
            ':' => result.push_str("%3A"),
            '*' => result.push_str("%2A"),
            '?' => result.push_str("%3F"),
            '"' => result.push_str("%22"),
            '<' => result.push_str("%3C"),
            '>' => result.push_str("%3E"),
            '|' => result.push_str("%7C"),
            '%' => result.push_str("%25"),
            c => result.push(c),
        }
    }
    result
}
