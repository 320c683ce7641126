use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use redis::{aio::MultiplexedConnection, Client, RedisError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::store::{
    CollectionPath, CommitOutcome, Document, DocumentPath, DocumentStore, Fields, StoreError,
    TransactionHandle, Write,
};

/// Redis-backed document store.
///
/// Each document is a JSON string under `doc:{path}`, collection membership is a
/// set under `col:{collection}`, and every committed change is published on
/// `change:{path}` with the new JSON (or `null` after a delete).
pub struct RedisService {
    client: Client,
    connection: MultiplexedConnection,
}

pub struct RedisKeys;

impl RedisKeys {
    pub const DOCUMENT_PREFIX: &'static str = "doc:";
    pub const COLLECTION_PREFIX: &'static str = "col:";
    pub const CHANGE_PREFIX: &'static str = "change:";

    pub fn document(path: &DocumentPath) -> String {
        format!("{}{}", Self::DOCUMENT_PREFIX, path)
    }

    pub fn collection(collection: &CollectionPath) -> String {
        format!("{}{}", Self::COLLECTION_PREFIX, collection)
    }

    pub fn change_channel(path: &DocumentPath) -> String {
        format!("{}{}", Self::CHANGE_PREFIX, path)
    }
}

fn parse_fields(raw: Option<String>) -> Result<Option<Fields>, StoreError> {
    match raw {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

async fn fetch_fields(
    connection: &mut MultiplexedConnection,
    path: &DocumentPath,
) -> Result<Option<Fields>, StoreError> {
    let raw: Option<String> = redis::cmd("GET")
        .arg(RedisKeys::document(path))
        .query_async(connection)
        .await?;
    parse_fields(raw)
}

/// Queues the commands that store (or remove) one document, keep its
/// collection index in step and notify watchers.
fn queue_change(
    pipe: &mut redis::Pipeline,
    path: &DocumentPath,
    next: Option<&Fields>,
) -> Result<(), StoreError> {
    let collection = RedisKeys::collection(&path.parent());
    let channel = RedisKeys::change_channel(path);
    match next {
        Some(data) => {
            let serialized = serde_json::to_string(data)?;
            pipe.cmd("SET")
                .arg(RedisKeys::document(path))
                .arg(&serialized)
                .ignore();
            pipe.cmd("SADD").arg(&collection).arg(path.id()).ignore();
            pipe.cmd("PUBLISH").arg(&channel).arg(&serialized).ignore();
        }
        None => {
            pipe.cmd("DEL").arg(RedisKeys::document(path)).ignore();
            pipe.cmd("SREM").arg(&collection).arg(path.id()).ignore();
            pipe.cmd("PUBLISH").arg(&channel).arg("null").ignore();
        }
    }
    Ok(())
}

impl RedisService {
    pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self { client, connection })
    }
}

/// A transaction attempt on its own connection, so that `WATCH` state is not
/// shared with other callers.
struct RedisTransaction {
    connection: MultiplexedConnection,
    /// Documents read (and watched) by this attempt.
    watched: HashMap<DocumentPath, Option<Fields>>,
}

impl RedisTransaction {
    async fn watch_and_get(&mut self, path: &DocumentPath) -> Result<Option<Fields>, StoreError> {
        if let Some(cached) = self.watched.get(path) {
            return Ok(cached.clone());
        }
        let _: () = redis::cmd("WATCH")
            .arg(RedisKeys::document(path))
            .query_async(&mut self.connection)
            .await?;
        let fields = fetch_fields(&mut self.connection, path).await?;
        self.watched.insert(path.clone(), fields.clone());
        Ok(fields)
    }

    async fn unwatch(&mut self) {
        let result: Result<(), RedisError> = redis::cmd("UNWATCH")
            .query_async(&mut self.connection)
            .await;
        if let Err(e) = result {
            debug!("UNWATCH failed: {}", e);
        }
    }
}

#[async_trait]
impl TransactionHandle for RedisTransaction {
    async fn read(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        Ok(self
            .watch_and_get(path)
            .await?
            .map(|data| Document::new(path.clone(), data)))
    }

    async fn commit(mut self: Box<Self>, writes: Vec<Write>) -> Result<CommitOutcome, StoreError> {
        // Partial updates merge into the current value, which has to be watched
        // before MULTI like any other read.
        for write in &writes {
            if let Write::Update { path, .. } = write {
                self.watch_and_get(path).await?;
            }
        }

        let now = Utc::now();
        let mut staged: BTreeMap<DocumentPath, Option<Fields>> = BTreeMap::new();
        for write in &writes {
            let path = write.path();
            let current = match staged.get(path) {
                Some(pending) => pending.clone(),
                None => self.watched.get(path).cloned().flatten(),
            };
            match write.apply(current.as_ref(), now) {
                Ok(next) => {
                    staged.insert(path.clone(), next);
                }
                Err(e) => {
                    self.unwatch().await;
                    return Err(e);
                }
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (path, next) in &staged {
            queue_change(&mut pipe, path, next.as_ref())?;
        }

        // EXEC replies nil when a watched key changed after WATCH.
        let result: Option<redis::Value> = pipe.query_async(&mut self.connection).await?;
        match result {
            Some(_) => Ok(CommitOutcome::Committed),
            None => Ok(CommitOutcome::Conflict),
        }
    }
}

#[async_trait]
impl DocumentStore for RedisService {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        let mut connection = self.connection.clone();
        Ok(fetch_fields(&mut connection, path)
            .await?
            .map(|data| Document::new(path.clone(), data)))
    }

    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>, StoreError> {
        let mut connection = self.connection.clone();
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(RedisKeys::collection(collection))
            .query_async(&mut connection)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();

        let paths = ids
            .iter()
            .map(|id| collection.doc(id))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let keys: Vec<String> = paths.iter().map(RedisKeys::document).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut connection)
            .await?;

        let mut documents = Vec::with_capacity(values.len());
        for (path, raw) in paths.into_iter().zip(values) {
            if let Some(data) = parse_fields(raw)? {
                documents.push(Document::new(path, data));
            }
        }
        Ok(documents)
    }

    async fn begin(&self) -> Result<Box<dyn TransactionHandle>, StoreError> {
        let connection = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisTransaction {
            connection,
            watched: HashMap::new(),
        }))
    }

    /// Sets and deletes depend on no earlier value, so they skip `WATCH` and
    /// run on the shared connection. Updates merge into the stored document and
    /// take the transactional path.
    async fn commit_single(&self, write: Write) -> Result<(), StoreError> {
        if let Write::Update { .. } = write {
            let handle = self.begin().await?;
            return match handle.commit(vec![write]).await? {
                CommitOutcome::Committed => Ok(()),
                CommitOutcome::Conflict => Err(StoreError::Conflict),
            };
        }

        let next = write.apply(None, Utc::now())?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        queue_change(&mut pipe, write.path(), next.as_ref())?;

        let mut connection = self.connection.clone();
        let _: () = pipe.query_async(&mut connection).await?;
        Ok(())
    }

    async fn watch(
        &self,
        path: &DocumentPath,
    ) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(RedisKeys::change_channel(path)).await?;
        // Subscribed first, so a change between here and the read is not lost.
        let current = self.get(path).await?;
        let (sender, receiver) = watch::channel(current);
        let path = path.clone();

        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            warn!("Change subscription for {} closed", path);
                            break;
                        };
                        let document = message
                            .get_payload::<String>()
                            .map_err(StoreError::from)
                            .and_then(|payload| Ok(serde_json::from_str::<Option<Fields>>(&payload)?));
                        match document {
                            Ok(data) => {
                                let next = data.map(|data| Document::new(path.clone(), data));
                                if sender.send(next).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Ignoring malformed change for {}: {}", path, e),
                        }
                    }
                }
            }
            debug!("Stopped watching {}", path);
        });

        Ok(receiver)
    }
}
