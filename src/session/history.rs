//! Session persistence.
//!
//! [`HistoryProvider`] is the storage seam the context manager writes
//! through. Two implementations ship with the crate:
//!
//! - [`MemoryHistoryProvider`]: process-local, for tests and ephemeral runs
//! - [`FileHistoryProvider`]: one append-only JSONL message log plus one JSON
//!   metadata file per session
//!
//! Reads tolerate damage: corrupted lines are skipped and repeated message
//! ids are collapsed to their first occurrence.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::types::{CompactionCheckpoint, Message, Session, TokenBudget};
use super::usage::ModelUsage;
use crate::agent::tokenizer::ProviderFamily;
use crate::config::Config;
use crate::error::Result;

/// Persists and retrieves a session's message log and metadata.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Load a session, or `None` if nothing was ever stored for `session_id`.
    ///
    /// Implementations must deduplicate messages by id and skip entries that
    /// fail to decode.
    async fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// Append one message to the session's log.
    async fn append(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Replace the whole message log (after compaction).
    async fn replace(&self, session_id: &str, messages: &[Message]) -> Result<()>;

    /// Persist budget, usage and compaction metadata.
    async fn save_meta(&self, session: &Session) -> Result<()>;
}

/// Session metadata stored next to the message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMeta {
    id: String,
    #[serde(default)]
    budget: TokenBudget,
    #[serde(default)]
    usage: HashMap<String, ModelUsage>,
    #[serde(default)]
    compactions: Vec<CompactionCheckpoint>,
    #[serde(default)]
    provider_family: Option<ProviderFamily>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl SessionMeta {
    fn from_session(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            budget: session.budget.clone(),
            usage: session.usage.clone(),
            compactions: session.compactions.clone(),
            provider_family: session.provider_family,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }

    fn into_session(self, messages: Vec<Message>) -> Session {
        Session {
            id: self.id,
            messages,
            budget: self.budget,
            usage: self.usage,
            compactions: self.compactions,
            provider_family: self.provider_family,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Drop messages whose id was already seen, keeping the first occurrence.
pub fn dedupe_messages(messages: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let before = messages.len();
    let out: Vec<Message> = messages
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();
    if out.len() != before {
        debug!(dropped = before - out.len(), "Dropped duplicate history entries");
    }
    out
}

// ============================================================================
// In-memory provider
// ============================================================================

/// Process-local history, lost on exit.
#[derive(Default)]
pub struct MemoryHistoryProvider {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemoryHistoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryProvider for MemoryHistoryProvider {
    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().map(|mut s| {
            s.messages = dedupe_messages(std::mem::take(&mut s.messages));
            s
        }))
    }

    async fn append(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id))
            .add_message(message.clone());
        Ok(())
    }

    async fn replace(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.messages = messages.to_vec();
        Ok(())
    }

    async fn save_meta(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session.id.clone())
            .or_insert_with(|| Session::new(&session.id));
        let messages = std::mem::take(&mut entry.messages);
        *entry = SessionMeta::from_session(session).into_session(messages);
        Ok(())
    }
}

// ============================================================================
// File provider
// ============================================================================

/// JSONL-backed history under a directory.
///
/// Layout: `<dir>/<key>.jsonl` holds one message per line and
/// `<dir>/<key>.meta.json` holds metadata, where `<key>` is the
/// percent-encoded session id.
pub struct FileHistoryProvider {
    storage_path: PathBuf,
}

impl FileHistoryProvider {
    /// Create a provider using the default directory (`~/.conduit/sessions`).
    pub fn new() -> Result<Self> {
        Self::with_path(Config::dir().join("sessions"))
    }

    /// Create a provider rooted at a custom directory.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { storage_path: path })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.storage_path
            .join(format!("{}.jsonl", sanitize_key(session_id)))
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.storage_path
            .join(format!("{}.meta.json", sanitize_key(session_id)))
    }

    async fn read_log(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
        let path = self.log_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(
                        session_id = session_id,
                        line = line_no + 1,
                        error = %e,
                        "Skipping corrupted history entry"
                    );
                    continue;
                }
            }
        }
        Ok(Some(dedupe_messages(messages)))
    }

    async fn read_meta(&self, session_id: &str) -> Option<SessionMeta> {
        let content = tokio::fs::read_to_string(self.meta_path(session_id))
            .await
            .ok()?;
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(session_id = session_id, error = %e, "Ignoring corrupted session metadata");
                None
            }
        }
    }
}

#[async_trait]
impl HistoryProvider for FileHistoryProvider {
    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let messages = self.read_log(session_id).await?;
        let meta = self.read_meta(session_id).await;

        Ok(match (messages, meta) {
            (None, None) => None,
            (messages, Some(meta)) => Some(meta.into_session(messages.unwrap_or_default())),
            (Some(messages), None) => {
                let mut session = Session::new(session_id);
                session.messages = messages;
                Some(session)
            }
        })
    }

    async fn append(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn replace(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let mut content = String::new();
        for msg in messages {
            content.push_str(&serde_json::to_string(msg)?);
            content.push('\n');
        }
        // Write-then-rename so a crash never leaves a half-written log.
        let path = self.log_path(session_id);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn save_meta(&self, session: &Session) -> Result<()> {
        let content = serde_json::to_string_pretty(&SessionMeta::from_session(session))?;
        tokio::fs::write(self.meta_path(&session.id), content).await?;
        Ok(())
    }
}

/// Percent-encode characters that are problematic in filenames.
pub fn sanitize_key(key: &str) -> String {
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
