//! Append-only decision, action and experience log
//!
//! [`EventLog`] never fails the caller: append errors are logged at debug
//! level and dropped. Stores that can be queried also feed the daily
//! trainer through [`EventStore::experiences_since`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

use ethos_core::{Experience, Result, ValueWeights};

/// Event type of replay transitions
pub const EXPERIENCE_EVENT: &str = "experience";

/// One persisted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Position in the log, starting at 1
    pub seq: u64,
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,
    /// Append time
    pub timestamp: DateTime<Utc>,
    /// Event body
    pub payload: Value,
}

/// Payload of an [`EXPERIENCE_EVENT`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedExperience {
    /// The transition
    #[serde(flatten)]
    pub experience: Experience,
    /// Corrects the transition logged just before it
    #[serde(default)]
    pub replaces_previous: bool,
}

/// Experiences logged after a cursor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperienceBatch {
    /// Transitions in log order
    pub experiences: Vec<LoggedExperience>,
    /// Cursor to pass next time
    pub cursor: u64,
}

fn collect_experiences<'a>(events: impl Iterator<Item = &'a StoredEvent>, cursor: u64) -> ExperienceBatch {
    let mut batch = ExperienceBatch {
        experiences: Vec::new(),
        cursor,
    };
    for event in events.filter(|e| e.seq > cursor) {
        batch.cursor = batch.cursor.max(event.seq);
        if event.event_type != EXPERIENCE_EVENT {
            continue;
        }
        match serde_json::from_value::<LoggedExperience>(event.payload.clone()) {
            Ok(logged) => batch.experiences.push(logged),
            Err(error) => tracing::debug!(seq = event.seq, %error, "skipping malformed experience event"),
        }
    }
    batch
}

/// Persistence store contract
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event
    async fn append(&self, event_type: &str, payload: Value) -> Result<()>;

    /// Experience events with a sequence number above `cursor`
    async fn experiences_since(&self, cursor: u64) -> Result<ExperienceBatch> {
        Ok(ExperienceBatch {
            experiences: Vec::new(),
            cursor,
        })
    }
}

/// One JSON object per line
#[derive(Debug)]
pub struct JsonlEventStore {
    path: PathBuf,
    seq: tokio::sync::Mutex<u64>,
}

impl JsonlEventStore {
    /// Open or create the log at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let seq = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| serde_json::from_str::<StoredEvent>(line).ok())
                .map(|e| e.seq)
                .max()
                .unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            seq: tokio::sync::Mutex::new(seq),
        })
    }

    /// Location of the log
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable event in the log
    pub async fn events(&self) -> Result<Vec<StoredEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(&self, event_type: &str, payload: Value) -> Result<()> {
        let mut seq = self.seq.lock().await;
        let event = StoredEvent {
            seq: *seq + 1,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        *seq = event.seq;
        Ok(())
    }

    async fn experiences_since(&self, cursor: u64) -> Result<ExperienceBatch> {
        let events = self.events().await?;
        Ok(collect_experiences(events.iter(), cursor))
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Events of one type
    #[must_use]
    pub fn events_of(&self, event_type: &str) -> Vec<StoredEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event_type: &str, payload: Value) -> Result<()> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = events.len() as u64 + 1;
        events.push(StoredEvent {
            seq,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        });
        Ok(())
    }

    async fn experiences_since(&self, cursor: u64) -> Result<ExperienceBatch> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(collect_experiences(events.iter(), cursor))
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventStore;

#[async_trait]
impl EventStore for NullEventStore {
    async fn append(&self, _event_type: &str, _payload: Value) -> Result<()> {
        Ok(())
    }
}

/// Best-effort typed writer over an [`EventStore`]
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    /// Wrap `store`
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    async fn record(&self, event_type: &str, payload: Value) {
        if let Err(error) = self.store.append(event_type, payload).await {
            tracing::debug!(event_type, %error, "event log append failed");
        }
    }

    /// Outcome of a decision cycle
    pub async fn decision(&self, payload: Value) {
        self.record("decision", payload).await;
    }

    /// Adapter execution
    pub async fn action(&self, payload: Value) {
        self.record("action", payload).await;
    }

    /// Value weights changed
    pub async fn weights(&self, weights: &ValueWeights) {
        self.record("weights", json!(weights)).await;
    }

    /// A trainer started
    pub async fn training_started(&self, trainer: &str) {
        self.record("training_started", json!({ "trainer": trainer })).await;
    }

    /// A trainer stopped
    pub async fn training_stopped(&self, trainer: &str) {
        self.record("training_stopped", json!({ "trainer": trainer })).await;
    }

    /// One training step finished
    pub async fn trained(&self, step: u64, loss: f32, synced: bool) {
        self.record("trained", json!({ "step": step, "loss": loss, "synced": synced }))
            .await;
    }

    /// Replay transition
    pub async fn experience(&self, experience: &Experience, replaces_previous: bool) {
        let logged = LoggedExperience {
            experience: experience.clone(),
            replaces_previous,
        };
        match serde_json::to_value(&logged) {
            Ok(payload) => self.record(EXPERIENCE_EVENT, payload).await,
            Err(error) => tracing::debug!(%error, "experience not serializable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn append(&self, _event_type: &str, _payload: Value) -> Result<()> {
            Err(ethos_core::EthosError::Persistence("disk full".into()))
        }
    }

    fn exp(reward: f32) -> Experience {
        Experience::new(vec![0.0, 1.0], 1, reward, vec![0.0, 1.0], false).unwrap()
    }

    #[tokio::test]
    async fn jsonl_store_appends_and_resumes_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        {
            let log = EventLog::new(Arc::new(JsonlEventStore::open(&path).await.unwrap()));
            log.decision(json!({ "ok": true })).await;
            log.experience(&exp(1.0), false).await;
        }
        let store = JsonlEventStore::open(&path).await.unwrap();
        store.append("weights", json!({})).await.unwrap();

        let events = store.events().await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[0].event_type, "decision");

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.lines().all(|l| l.contains("\"timestamp\"")));
    }

    #[tokio::test]
    async fn experiences_since_honours_cursor() {
        let store = Arc::new(MemoryEventStore::new());
        let log = EventLog::new(store.clone());
        log.experience(&exp(1.0), false).await;
        log.trained(1, 0.5, false).await;
        log.experience(&exp(2.0), true).await;

        let all = store.experiences_since(0).await.unwrap();
        assert_eq!(all.experiences.len(), 2);
        assert_eq!(all.cursor, 3);
        assert!(all.experiences[1].replaces_previous);

        let later = store.experiences_since(1).await.unwrap();
        assert_eq!(later.experiences.len(), 1);
        assert_eq!(later.experiences[0].experience.reward, 2.0);

        let none = store.experiences_since(3).await.unwrap();
        assert!(none.experiences.is_empty());
        assert_eq!(none.cursor, 3);
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let log = EventLog::new(Arc::new(FailingStore));
        log.decision(json!({})).await;
        log.training_started("periodic").await;

        let null = EventLog::new(Arc::new(NullEventStore));
        null.experience(&exp(0.0), false).await;
        let batch = NullEventStore.experiences_since(7).await.unwrap();
        assert_eq!(batch.cursor, 7);
    }
}
