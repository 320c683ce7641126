//! Document store client.
//!
//! A schemaless key-path database: documents live at `collection/id` paths
//! (nested collections allowed), are read and written as JSON objects, and
//! can be mutated atomically in groups through optimistic transactions.

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

pub mod memory;
pub mod transaction;

pub use memory::MemoryStore;
pub use transaction::{run_transaction, RetryPolicy, Transaction, TransactionError};

/// Field map of a single document.
pub type Fields = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction conflict")]
    Conflict,

    #[error("Document not found: {0}")]
    NotFound(DocumentPath),

    #[error("Invalid document path: {0}")]
    InvalidPath(String),

    #[error("Reads must happen before any write in a transaction")]
    ReadAfterWrite,

    #[error("Document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Path of a document: an even number of non-empty segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

/// Path of a collection: an odd number of non-empty segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath(String);

fn segment_count(raw: &str) -> Result<usize, StoreError> {
    if raw.is_empty() || raw.split('/').any(|segment| segment.is_empty()) {
        return Err(StoreError::InvalidPath(raw.to_string()));
    }
    Ok(raw.split('/').count())
}

fn check_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') {
        return Err(StoreError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

impl DocumentPath {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match segment_count(raw)? {
            n if n % 2 == 0 => Ok(Self(raw.to_string())),
            _ => Err(StoreError::InvalidPath(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the path.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    pub fn collection(&self, name: &str) -> Result<CollectionPath, StoreError> {
        check_segment(name)?;
        Ok(CollectionPath(format!("{}/{}", self.0, name)))
    }
}

impl CollectionPath {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match segment_count(raw)? {
            n if n % 2 == 1 => Ok(Self(raw.to_string())),
            _ => Err(StoreError::InvalidPath(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn doc(&self, id: &str) -> Result<DocumentPath, StoreError> {
        check_segment(id)?;
        Ok(DocumentPath(format!("{}/{}", self.0, id)))
    }
}

impl Display for DocumentPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for CollectionPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub path: DocumentPath,
    pub data: Fields,
}

impl Document {
    pub fn new(path: DocumentPath, data: Fields) -> Self {
        Self { path, data }
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }
}

/// Serializes a value into a document field map. Non-object values are rejected.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(StoreError::Serialization(serde::ser::Error::custom(
            format!("expected an object document, got {}", other),
        ))),
    }
}

/// A buffered mutation, applied when its transaction commits.
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    Set {
        path: DocumentPath,
        data: Fields,
        /// Fields to fill with the commit time.
        server_timestamps: Vec<String>,
    },
    Update {
        path: DocumentPath,
        data: Fields,
    },
    Delete {
        path: DocumentPath,
    },
}

impl Write {
    pub fn path(&self) -> &DocumentPath {
        match self {
            Write::Set { path, .. } | Write::Update { path, .. } | Write::Delete { path } => path,
        }
    }

    /// Computes the document that results from applying this write over `current`.
    /// `None` means the document no longer exists.
    pub fn apply(
        &self,
        current: Option<&Fields>,
        now: DateTime<Utc>,
    ) -> Result<Option<Fields>, StoreError> {
        match self {
            Write::Set {
                data,
                server_timestamps,
                ..
            } => {
                let mut data = data.clone();
                let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
                for field in server_timestamps {
                    data.insert(field.clone(), Value::String(stamp.clone()));
                }
                Ok(Some(data))
            }
            Write::Update { path, data } => {
                let mut merged = current
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(path.clone()))?;
                for (field, value) in data {
                    merged.insert(field.clone(), value.clone());
                }
                Ok(Some(merged))
            }
            Write::Delete { .. } => Ok(None),
        }
    }
}

/// Result of committing one transaction attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// A document read by the attempt changed before commit.
    Conflict,
}

/// One optimistic transaction attempt owned by a backend.
#[async_trait]
pub trait TransactionHandle: Send {
    /// Reads a document and tracks it for conflict detection.
    async fn read(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError>;

    /// Applies all writes atomically, unless a tracked read changed.
    async fn commit(self: Box<Self>, writes: Vec<Write>) -> Result<CommitOutcome, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError>;

    /// Direct children of a collection.
    async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn TransactionHandle>, StoreError>;

    /// Live value of one document, seeded with its current state.
    async fn watch(
        &self,
        path: &DocumentPath,
    ) -> Result<watch::Receiver<Option<Document>>, StoreError>;

    async fn set(&self, path: &DocumentPath, data: Fields) -> Result<(), StoreError> {
        self.commit_single(Write::Set {
            path: path.clone(),
            data,
            server_timestamps: Vec::new(),
        })
        .await
    }

    async fn update(&self, path: &DocumentPath, data: Fields) -> Result<(), StoreError> {
        self.commit_single(Write::Update {
            path: path.clone(),
            data,
        })
        .await
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError> {
        self.commit_single(Write::Delete { path: path.clone() }).await
    }

    /// Commits a lone write. Single writes carry no read set, so they never conflict.
    async fn commit_single(&self, write: Write) -> Result<(), StoreError> {
        let handle = self.begin().await?;
        match handle.commit(vec![write]).await? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Conflict => Err(StoreError::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("users/alice")]
    #[case("users/alice/followers/bob")]
    fn parses_document_paths(#[case] raw: &str) {
        let path = DocumentPath::parse(raw).unwrap();
        assert_eq!(path.as_str(), raw);
    }

    #[rstest]
    #[case("")]
    #[case("users")]
    #[case("users//bob")]
    #[case("users/alice/followers")]
    fn rejects_invalid_document_paths(#[case] raw: &str) {
        assert!(matches!(
            DocumentPath::parse(raw),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn navigates_between_documents_and_collections() {
        let user = CollectionPath::parse("users").unwrap().doc("bob").unwrap();
        let marker = user.collection("followers").unwrap().doc("alice").unwrap();

        assert_eq!(marker.as_str(), "users/bob/followers/alice");
        assert_eq!(marker.id(), "alice");
        assert_eq!(marker.parent().as_str(), "users/bob/followers");
        assert!(CollectionPath::parse("users").unwrap().doc("a/b").is_err());
    }

    #[test]
    fn update_merges_into_existing_fields() {
        let path = DocumentPath::parse("users/bob").unwrap();
        let current = to_fields(&json!({ "name": "Bob", "followers": 10 })).unwrap();
        let write = Write::Update {
            path,
            data: to_fields(&json!({ "followers": 11 })).unwrap(),
        };

        let next = write.apply(Some(&current), Utc::now()).unwrap().unwrap();
        assert_eq!(next["name"], json!("Bob"));
        assert_eq!(next["followers"], json!(11));
    }

    #[test]
    fn update_of_missing_document_fails() {
        let path = DocumentPath::parse("users/ghost").unwrap();
        let write = Write::Update {
            path,
            data: Fields::new(),
        };
        assert!(matches!(
            write.apply(None, Utc::now()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn set_fills_server_timestamps() {
        let path = DocumentPath::parse("users/bob/followers/alice").unwrap();
        let now = Utc::now();
        let write = Write::Set {
            path,
            data: Fields::new(),
            server_timestamps: vec!["followedAt".to_string()],
        };

        let data = write.apply(None, now).unwrap().unwrap();
        let stamp = data["followedAt"].as_str().unwrap();
        let parsed = DateTime::parse_from_rfc3339(stamp).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
