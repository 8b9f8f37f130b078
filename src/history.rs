use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::completion::CompletionEvent;
use crate::error::HistoryError;
use crate::types::{format_timestamp, CombinedResult};

/// A completed scan as handed to the persistence collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub domain: String,
    pub source: String,
    pub start_time: String,
    pub end_time: String,
    pub result: CombinedResult,
}

impl From<&CompletionEvent> for NewHistoryEntry {
    fn from(event: &CompletionEvent) -> Self {
        Self {
            domain: event.domain.clone(),
            source: event.source.clone(),
            start_time: format_timestamp(event.started_at),
            end_time: format_timestamp(event.ended_at),
            result: event.combined.clone(),
        }
    }
}

/// A stored scan. Entries are never modified after they are written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: u64,
    pub domain: String,
    pub source: String,
    pub start_time: String,
    pub end_time: String,
    pub result: CombinedResult,
}

impl HistoryEntry {
    pub fn from_new(id: u64, entry: NewHistoryEntry) -> Self {
        Self {
            id,
            domain: entry.domain,
            source: entry.source,
            start_time: entry.start_time,
            end_time: entry.end_time,
            result: entry.result,
        }
    }
}

/// Where a finished session is stored. Called once per completed session;
/// retries, if any, are the implementation's business.
#[async_trait]
pub trait PersistenceBridge: Send + Sync {
    async fn save(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, HistoryError>;
}

#[async_trait]
pub trait HistoryStore: PersistenceBridge {
    /// Newest first.
    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError>;
    /// Remove an entry. Unknown ids are not an error; returns whether something was removed.
    async fn delete(&self, id: u64) -> Result<bool, HistoryError>;
}

fn newest_first(mut entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    entries.sort_by(|a, b| b.id.cmp(&a.id));
    entries
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Vec<HistoryEntry>,
    next_id: u64,
    saves: usize,
}

/// In-process history, mostly for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    inner: Mutex<MemoryInner>,
    unavailable: bool,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose saves always fail.
    pub fn unavailable() -> Self {
        Self {
            inner: Mutex::default(),
            unavailable: true,
        }
    }

    /// Number of `save` calls received, failed ones included.
    pub async fn save_calls(&self) -> usize {
        self.inner.lock().await.saves
    }
}

#[async_trait]
impl PersistenceBridge for MemoryHistory {
    async fn save(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, HistoryError> {
        let mut inner = self.inner.lock().await;
        inner.saves += 1;
        if self.unavailable {
            return Err(HistoryError::Unavailable("memory store is read-only".into()));
        }
        inner.next_id += 1;
        let stored = HistoryEntry::from_new(inner.next_id, entry);
        inner.entries.push(stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(newest_first(self.inner.lock().await.entries.clone()))
    }

    async fn delete(&self, id: u64) -> Result<bool, HistoryError> {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != id);
        Ok(inner.entries.len() != before)
    }
}

/// History kept in a single JSON file. A missing file is an empty history.
///
/// Ids come from a counter stored next to the entries, so an id is never
/// handed out twice even after the newest entry is deleted.
#[derive(Debug)]
pub struct FileHistory {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct HistoryFile {
    next_id: u64,
    entries: Vec<HistoryEntry>,
}

/// On-disk layouts: the current one, or a bare entry list from older files.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredHistory {
    Current(HistoryFile),
    Legacy(Vec<HistoryEntry>),
}

impl From<StoredHistory> for HistoryFile {
    fn from(stored: StoredHistory) -> Self {
        match stored {
            StoredHistory::Current(file) => file,
            StoredHistory::Legacy(entries) => HistoryFile {
                next_id: entries.iter().map(|e| e.id).max().unwrap_or(0) + 1,
                entries,
            },
        }
    }
}

impl HistoryFile {
    fn allocate_id(&mut self) -> u64 {
        let floor = self.entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        let id = self.next_id.max(floor);
        self.next_id = id + 1;
        id
    }
}

impl FileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HistoryFile, HistoryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HistoryFile::default()),
            Ok(bytes) => Ok(serde_json::from_slice::<StoredHistory>(&bytes)?.into()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HistoryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, file: &HistoryFile) -> Result<(), HistoryError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceBridge for FileHistory {
    async fn save(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, HistoryError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let id = file.allocate_id();
        let stored = HistoryEntry::from_new(id, entry);
        file.entries.push(stored.clone());
        self.store(&file).await?;
        debug!(id, path = %self.path.display(), "history entry written");
        Ok(stored)
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let _guard = self.lock.lock().await;
        Ok(newest_first(self.load().await?.entries))
    }

    async fn delete(&self, id: u64) -> Result<bool, HistoryError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let before = file.entries.len();
        file.entries.retain(|e| e.id != id);
        if file.entries.len() == before {
            return Ok(false);
        }
        self.store(&file).await?;
        Ok(true)
    }
}

#[derive(Deserialize)]
struct SavedReply {
    id: u64,
}

#[derive(Deserialize)]
struct DeletedReply {
    #[serde(default = "removed_default")]
    removed: bool,
}

fn removed_default() -> bool {
    true
}

/// Client for the backend's `/save` and `/history` routes.
#[derive(Debug, Clone)]
pub struct HttpHistory {
    client: reqwest::Client,
    base: String,
}

impl HttpHistory {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, HistoryError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(HistoryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl PersistenceBridge for HttpHistory {
    async fn save(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, HistoryError> {
        let resp = self
            .client
            .post(format!("{}/save", self.base))
            .json(&entry)
            .send()
            .await?;
        let reply: SavedReply = Self::check(resp).await?.json().await?;
        Ok(HistoryEntry::from_new(reply.id, entry))
    }
}

#[async_trait]
impl HistoryStore for HttpHistory {
    async fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let resp = self
            .client
            .get(format!("{}/history", self.base))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn delete(&self, id: u64) -> Result<bool, HistoryError> {
        let resp = self
            .client
            .delete(format!("{}/history/{id}", self.base))
            .send()
            .await?;
        let reply: DeletedReply = Self::check(resp).await?.json().await?;
        Ok(reply.removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domain: &str) -> NewHistoryEntry {
        let mut result = CombinedResult::default();
        result.subdomains.insert(format!("a.{domain}"));
        NewHistoryEntry {
            domain: domain.to_string(),
            source: "bing".into(),
            start_time: "2024-01-01T00:00:00Z".into(),
            end_time: "2024-01-01T00:10:00Z".into(),
            result,
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("recon-stream-history-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn file_history_round_trip() {
        let path = temp_path();
        let store = FileHistory::new(&path);
        assert!(store.list().await.unwrap().is_empty());

        let first = store.save(entry("example.com")).await.unwrap();
        let second = store.save(entry("example.org")).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));

        // A fresh handle sees the same file.
        let reopened = FileHistory::new(&path);
        let listed = reopened.list().await.unwrap();
        assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(listed[1].result, first.result);

        assert!(reopened.delete(1).await.unwrap());
        assert!(!reopened.delete(999).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn deleted_ids_are_not_reused() {
        let path = temp_path();
        let store = FileHistory::new(&path);
        let a = store.save(entry("example.com")).await.unwrap();
        let b = store.save(entry("example.org")).await.unwrap();
        assert!(store.delete(b.id).await.unwrap());

        let c = FileHistory::new(&path).save(entry("example.net")).await.unwrap();
        assert_ne!(c.id, b.id);
        assert!(c.id > b.id);
        assert!(!store.delete(b.id).await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(a.id, 1);

        let memory = MemoryHistory::new();
        memory.save(entry("example.com")).await.unwrap();
        let last = memory.save(entry("example.org")).await.unwrap();
        memory.delete(last.id).await.unwrap();
        assert_ne!(memory.save(entry("example.net")).await.unwrap().id, last.id);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn bare_entry_list_files_still_load() {
        let path = temp_path();
        let legacy = vec![HistoryEntry::from_new(7, entry("example.com"))];
        std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let store = FileHistory::new(&path);
        assert_eq!(store.list().await.unwrap(), legacy);
        assert_eq!(store.save(entry("example.org")).await.unwrap().id, 8);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn memory_history_counts_failed_saves() {
        let store = MemoryHistory::unavailable();
        assert!(store.save(entry("example.com")).await.is_err());
        assert_eq!(store.save_calls().await, 1);
        assert!(store.list().await.unwrap().is_empty());
    }
}
