use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::debug;

use super::{
    CollectionPath, CommitOutcome, Document, DocumentPath, DocumentStore, Fields, StoreError,
    TransactionHandle, Write,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct State {
    documents: BTreeMap<DocumentPath, Fields>,
    /// Commit sequence of the last write to each path. Kept after deletion so a
    /// delete followed by a re-create still invalidates earlier reads.
    versions: HashMap<DocumentPath, u64>,
    sequence: u64,
}

impl State {
    fn version(&self, path: &DocumentPath) -> u64 {
        self.versions.get(path).copied().unwrap_or(0)
    }
}

/// A committed write: the new document, or `None` after a delete.
#[derive(Clone, Debug)]
struct Change {
    path: DocumentPath,
    document: Option<Document>,
}

/// Process-local document store, used for development and tests.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<Change>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
        }
    }

    async fn commit_writes(
        &self,
        reads: HashMap<DocumentPath, u64>,
        writes: Vec<Write>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(stale) = reads
            .iter()
            .find(|(path, version)| state.version(path) != **version)
        {
            debug!("Commit rejected, {} changed since it was read", stale.0);
            return Ok(CommitOutcome::Conflict);
        }

        // Validate every write before touching the state so a failing write
        // leaves nothing applied.
        let now = Utc::now();
        let mut staged: BTreeMap<DocumentPath, Option<Fields>> = BTreeMap::new();
        for write in &writes {
            let path = write.path();
            let current = match staged.get(path) {
                Some(pending) => pending.clone(),
                None => state.documents.get(path).cloned(),
            };
            let next = write.apply(current.as_ref(), now)?;
            staged.insert(path.clone(), next);
        }

        state.sequence += 1;
        let sequence = state.sequence;
        for (path, next) in staged {
            state.versions.insert(path.clone(), sequence);
            let document = match next {
                Some(data) => {
                    state.documents.insert(path.clone(), data.clone());
                    Some(Document::new(path.clone(), data))
                }
                None => {
                    state.documents.remove(&path);
                    None
                }
            };
            // No receivers simply means nobody is watching.
            let _ = self.changes.send(Change { path, document });
        }

        Ok(CommitOutcome::Committed)
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    reads: HashMap<DocumentPath, u64>,
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    async fn read(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        let state = self.store.state.lock().await;
        let version = state.version(path);
        // Re-reading a path keeps the first observed version.
        self.reads.entry(path.clone()).or_insert(version);
        Ok(state
            .documents
            .get(path)
            .map(|data| Document::new(path.clone(), data.clone())))
    }

    async fn commit(self: Box<Self>, writes: Vec<Write>) -> Result<CommitOutcome, StoreError> {
        let MemoryTransaction { store, reads } = *self;
        store.commit_writes(reads, writes).await
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .get(path)
            .map(|data| Document::new(path.clone(), data.clone())))
    }

    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .iter()
            .filter(|(path, _)| &path.parent() == collection)
            .map(|(path, data)| Document::new(path.clone(), data.clone()))
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn TransactionHandle>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            reads: HashMap::new(),
        }))
    }

    async fn watch(
        &self,
        path: &DocumentPath,
    ) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        // Subscribe before reading the seed so no commit falls in between.
        let mut changes = self.changes.subscribe();
        let current = self.get(path).await?;
        let (sender, receiver) = watch::channel(current);
        let path = path.clone();
        let store = self.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = sender.closed() => break,
                    change = changes.recv() => match change {
                        Ok(change) if change.path == path => change.document,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed changes; fall back to the latest stored value.
                            debug!("Watch on {} lagged by {} changes", path, skipped);
                            match store.get(&path).await {
                                Ok(document) => document,
                                Err(_) => continue,
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if sender.send(next).is_err() {
                    break;
                }
            }
            debug!("Stopped watching {}", path);
        });

        Ok(receiver)
    }
}
