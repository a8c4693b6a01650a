use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{DocumentStore, StorageError};

pub const DEFAULT_HISTORY_CAP: usize = 200;

const CHAT_LOG_DOC: &str = "chat_history.json";
const DIARY_DOC: &str = "diary/diary.json";
const STATE_DOC: &str = "memory/state.json";
const IDENTITY_DOC: &str = "memory/identity.json";
const COUNTERPART_DOC: &str = "memory/about_counterpart.json";
const RELATIONSHIP_DOC: &str = "memory/about_relationship.json";
const API_CONFIG_DOC: &str = "config.json";

// Caps that keep summary() bounded no matter how long the history grows.
const SUMMARY_MESSAGES: usize = 10;
const SUMMARY_MESSAGE_CHARS: usize = 100;
const SUMMARY_DIARY_ENTRIES: usize = 3;
const SUMMARY_DIARY_CHARS: usize = 160;
const SUMMARY_FACTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One typed unit inside a multimodal message, shaped exactly like the
/// provider's wire format so it serializes straight into a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// Message payload: either a plain string or an ordered list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Multipart(Vec<Block>),
}

impl Content {
    pub fn text(value: impl Into<String>) -> Self {
        Content::Text(value.into())
    }

    /// All text carried by this content, image blocks elided.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Multipart(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    Block::Text { text } => Some(text.as_str()),
                    Block::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub initiated_by_agent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub date: NaiveDate,
    pub text: String,
    pub message_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactSubject {
    Counterpart,
    Relationship,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactItem {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FactList {
    facts: Vec<FactItem>,
}

/// Static who-the-agent-is lines rendered at the top of every summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    pub facts: Vec<String>,
}

/// The one mutable record the scheduler read-modify-writes every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub mood: f64,
    pub last_feeling: Option<String>,
    pub last_thought: Option<String>,
    pub initialized: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            mood: 0.5,
            last_feeling: None,
            last_thought: None,
            initialized: None,
            updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ApiConfig {
    api_key: Option<String>,
}

/// Append-only conversational memory: a trimmed fast-access log, untrimmed
/// per-day shards, diary, relationship facts and the mutable agent state.
pub struct MemoryStore {
    store: DocumentStore,
    history_cap: usize,
}

impl MemoryStore {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = DocumentStore::open(data_dir)?;
        let memory = Self {
            store,
            history_cap: DEFAULT_HISTORY_CAP,
        };
        memory.init_first_run()?;
        Ok(memory)
    }

    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    pub fn data_dir(&self) -> &Path {
        self.store.root()
    }

    /// Stamp the state record and seed an empty identity document the first
    /// time this data directory is used.
    fn init_first_run(&self) -> Result<(), StorageError> {
        let state: AgentState = self.store.load_or_default(STATE_DOC)?;
        if state.initialized.is_none() {
            self.store.update::<AgentState, _>(STATE_DOC, |s| {
                s.initialized = Some(Utc::now());
                s.updated = Utc::now();
            })?;
            if self.store.load::<Identity>(IDENTITY_DOC)?.is_none() {
                self.store.save(IDENTITY_DOC, &Identity::default())?;
            }
            tracing::info!("Memory initialized at {}", self.store.root().display());
        }
        Ok(())
    }

    fn shard_doc(date: NaiveDate) -> String {
        format!("chats/{}.json", date.format("%Y-%m-%d"))
    }

    fn diary_shard_doc(date: NaiveDate) -> String {
        format!("diary/{}.json", date.format("%Y-%m-%d"))
    }

    /// Append one message to both the trimmed log and that day's shard.
    /// Persists immediately; a crash loses at most the in-flight call.
    pub fn append(&self, role: Role, content: Content) -> Result<Message, StorageError> {
        self.append_at(role, content, Utc::now(), false)
    }

    pub fn append_initiated(&self, content: Content) -> Result<Message, StorageError> {
        self.append_at(Role::Assistant, content, Utc::now(), true)
    }

    /// Timestamped append. The day shard is chosen from the timestamp's local
    /// calendar day; both documents are written under their locks in one
    /// cycle so the log and the shard can never diverge.
    pub fn append_at(
        &self,
        role: Role,
        content: Content,
        timestamp: DateTime<Utc>,
        initiated_by_agent: bool,
    ) -> Result<Message, StorageError> {
        let message = Message {
            role,
            content,
            timestamp,
            initiated_by_agent,
        };
        let day = timestamp.with_timezone(&Local).date_naive();
        let shard = Self::shard_doc(day);
        let cap = self.history_cap;
        let msg = message.clone();
        self.store
            .update_pair::<Vec<Message>, Vec<Message>, _>(CHAT_LOG_DOC, &shard, move |log, day_msgs| {
                log.push(msg.clone());
                if log.len() > cap {
                    let excess = log.len() - cap;
                    log.drain(..excess);
                }
                day_msgs.push(msg);
            })?;
        Ok(message)
    }

    /// Last `n` entries of the trimmed log, most recent last.
    pub fn recent_messages(&self, n: usize) -> Result<Vec<Message>, StorageError> {
        let log: Vec<Message> = self.store.load_or_default(CHAT_LOG_DOC)?;
        let skip = log.len().saturating_sub(n);
        Ok(log.into_iter().skip(skip).collect())
    }

    /// Recent turns stripped to `(role, content)`, ready for a request.
    pub fn context_for_request(&self, n: usize) -> Result<Vec<(Role, Content)>, StorageError> {
        Ok(self
            .recent_messages(n)?
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect())
    }

    pub fn time_since_last_message(&self) -> Result<Option<Duration>, StorageError> {
        let log: Vec<Message> = self.store.load_or_default(CHAT_LOG_DOC)?;
        Ok(log.last().map(|m| Utc::now() - m.timestamp))
    }

    pub fn last_message_was_agent(&self) -> Result<bool, StorageError> {
        let log: Vec<Message> = self.store.load_or_default(CHAT_LOG_DOC)?;
        Ok(log.last().map(|m| m.role == Role::Assistant).unwrap_or(false))
    }

    /// The full untrimmed history, reconstructed from the day shards in
    /// calendar order.
    pub fn full_history(&self) -> Result<Vec<Message>, StorageError> {
        let mut all = Vec::new();
        for name in self.store.list_documents("chats")? {
            let shard: Vec<Message> = self.store.load_or_default(&Self::shard_doc_by_name(&name))?;
            all.extend(shard);
        }
        Ok(all)
    }

    fn shard_doc_by_name(name: &str) -> String {
        format!("chats/{}.json", name)
    }

    /// Case-insensitive substring scan over the durable history, original
    /// order preserved. No index; volumes here are human-scale.
    pub fn search_history(&self, query: &str) -> Result<Vec<Message>, StorageError> {
        let needle = query.to_lowercase();
        Ok(self
            .full_history()?
            .into_iter()
            .filter(|m| m.content.as_text().to_lowercase().contains(&needle))
            .collect())
    }

    /// Write today's diary entry. A second call on the same calendar day is a
    /// silent no-op, never an error.
    pub fn write_diary(&self, text: &str) -> Result<(), StorageError> {
        self.write_diary_on(Local::now().date_naive(), text)
    }

    pub fn write_diary_on(&self, date: NaiveDate, text: &str) -> Result<(), StorageError> {
        let diary: Vec<DiaryEntry> = self.store.load_or_default(DIARY_DOC)?;
        if diary.iter().any(|e| e.date == date) {
            tracing::debug!("Diary entry for {} already exists, skipping", date);
            return Ok(());
        }
        let shard: Vec<Message> = self.store.load_or_default(&Self::shard_doc(date))?;
        let entry = DiaryEntry {
            date,
            text: text.to_string(),
            message_count: shard.len(),
        };
        self.store.update::<Vec<DiaryEntry>, _>(DIARY_DOC, {
            let entry = entry.clone();
            move |entries| {
                if !entries.iter().any(|e| e.date == entry.date) {
                    entries.push(entry);
                }
            }
        })?;
        self.store.save(&Self::diary_shard_doc(date), &entry)?;
        tracing::info!("Diary written for {}", date);
        Ok(())
    }

    pub fn has_diary_for(&self, date: NaiveDate) -> Result<bool, StorageError> {
        let diary: Vec<DiaryEntry> = self.store.load_or_default(DIARY_DOC)?;
        Ok(diary.iter().any(|e| e.date == date))
    }

    pub fn recent_diary(&self, n: usize) -> Result<Vec<DiaryEntry>, StorageError> {
        let diary: Vec<DiaryEntry> = self.store.load_or_default(DIARY_DOC)?;
        let skip = diary.len().saturating_sub(n);
        Ok(diary.into_iter().skip(skip).collect())
    }

    pub fn all_diary(&self) -> Result<Vec<DiaryEntry>, StorageError> {
        self.store.load_or_default(DIARY_DOC)
    }

    /// Messages persisted on one local calendar day, for diary composition.
    pub fn messages_for_day(&self, date: NaiveDate) -> Result<Vec<Message>, StorageError> {
        self.store.load_or_default(&Self::shard_doc(date))
    }

    pub fn record_fact(&self, about: FactSubject, text: &str) -> Result<(), StorageError> {
        let doc = match about {
            FactSubject::Counterpart => COUNTERPART_DOC,
            FactSubject::Relationship => RELATIONSHIP_DOC,
        };
        let item = FactItem {
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        self.store
            .update::<FactList, _>(doc, move |list| list.facts.push(item))?;
        Ok(())
    }

    pub fn facts(&self, about: FactSubject) -> Result<Vec<FactItem>, StorageError> {
        let doc = match about {
            FactSubject::Counterpart => COUNTERPART_DOC,
            FactSubject::Relationship => RELATIONSHIP_DOC,
        };
        let list: FactList = self.store.load_or_default(doc)?;
        Ok(list.facts)
    }

    pub fn record_mood(&self, value: f64) -> Result<AgentState, StorageError> {
        self.store.update::<AgentState, _>(STATE_DOC, move |s| {
            s.mood = value.clamp(0.0, 1.0);
            s.updated = Utc::now();
        })
    }

    pub fn update_state<F: FnOnce(&mut AgentState)>(
        &self,
        f: F,
    ) -> Result<AgentState, StorageError> {
        self.store.update::<AgentState, _>(STATE_DOC, |s| {
            f(s);
            s.mood = s.mood.clamp(0.0, 1.0);
            s.updated = Utc::now();
        })
    }

    pub fn get_state(&self) -> Result<AgentState, StorageError> {
        self.store.load_or_default(STATE_DOC)
    }

    pub fn identity(&self) -> Result<Identity, StorageError> {
        self.store.load_or_default(IDENTITY_DOC)
    }

    pub fn set_identity(&self, identity: &Identity) -> Result<(), StorageError> {
        self.store.save(IDENTITY_DOC, identity)
    }

    /// API key from the data directory's config document. Absence is normal
    /// (the scheduler idles); it is re-read on every call so a key dropped in
    /// while the daemon runs is picked up without a restart.
    pub fn api_key(&self) -> Result<Option<String>, StorageError> {
        let cfg: ApiConfig = self.store.load_or_default(API_CONFIG_DOC)?;
        Ok(cfg.api_key.filter(|k| !k.trim().is_empty()))
    }

    pub fn set_api_key(&self, key: &str) -> Result<(), StorageError> {
        self.store.save(
            API_CONFIG_DOC,
            &ApiConfig {
                api_key: Some(key.to_string()),
            },
        )
    }

    /// Deterministic bounded text block injected into the system prompt.
    /// The caps here are what keep prompts flat as history grows.
    pub fn summary(&self) -> Result<String, StorageError> {
        let identity = self.identity()?;
        let state = self.get_state()?;
        let log: Vec<Message> = self.store.load_or_default(CHAT_LOG_DOC)?;
        let recent_start = log.len().saturating_sub(SUMMARY_MESSAGES);
        let diary = self.recent_diary(SUMMARY_DIARY_ENTRIES)?;
        let about = self.facts(FactSubject::Counterpart)?;
        let us = self.facts(FactSubject::Relationship)?;

        let mut out = String::new();
        out.push_str("=== MY MEMORY ===\n\n");

        out.push_str("WHO I AM:\n");
        if identity.facts.is_empty() {
            out.push_str("- (no identity recorded yet)\n");
        }
        for line in &identity.facts {
            let _ = writeln!(out, "- {}", line);
        }

        let _ = writeln!(out, "\nMOOD: {:.2}", state.mood);
        if let Some(feeling) = &state.last_feeling {
            let _ = writeln!(out, "LAST FEELING: {}", feeling);
        }

        let _ = writeln!(out, "\nRECENT ({} in log):", log.len());
        for m in &log[recent_start..] {
            let _ = writeln!(
                out,
                "[{}] {}",
                m.role.as_str(),
                truncate(&m.content.as_text(), SUMMARY_MESSAGE_CHARS)
            );
        }

        if !diary.is_empty() {
            out.push_str("\nDIARY:\n");
            for e in &diary {
                let _ = writeln!(out, "{}: {}", e.date, truncate(&e.text, SUMMARY_DIARY_CHARS));
            }
        }

        if !about.is_empty() {
            out.push_str("\nABOUT THEM:\n");
            for f in about.iter().rev().take(SUMMARY_FACTS) {
                let _ = writeln!(out, "- {}", f.text);
            }
        }

        if !us.is_empty() {
            out.push_str("\nABOUT US:\n");
            for f in us.iter().rev().take(SUMMARY_FACTS) {
                let _ = writeln!(out, "- {}", f.text);
            }
        }

        Ok(out)
    }

    pub fn backup(&self, name: Option<&str>) -> Result<PathBuf, StorageError> {
        self.store.backup(name)
    }

    pub fn restore(&self, name: &str) -> Result<(), StorageError> {
        self.store.restore(name)
    }

    pub fn list_backups(&self) -> Result<Vec<String>, StorageError> {
        self.store.list_backups()
    }

    /// Truncate the fast-access log, forcing a backup first. Day shards are
    /// the durable record and are never cleared.
    pub fn clear_history(&self) -> Result<PathBuf, StorageError> {
        let backup = self.store.backup(None)?;
        self.store.save(CHAT_LOG_DOC, &Vec::<Message>::new())?;
        tracing::info!("Chat log cleared (backup at {})", backup.display());
        Ok(backup)
    }

    /// Plain-text transcript of the full durable history.
    pub fn export_transcript(&self, path: &Path) -> Result<(), StorageError> {
        let mut out = String::from("=== Chat Export ===\n\n");
        for m in self.full_history()? {
            let _ = writeln!(
                out,
                "[{}] {}:\n{}\n",
                m.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                m.role.as_str(),
                m.content.as_text()
            );
        }
        std::fs::write(path, out).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (idx, ch) in input.chars().enumerate() {
        if idx >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}
