use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use super::{
    CommitOutcome, Document, DocumentPath, DocumentStore, Fields, StoreError, TransactionHandle,
    Write,
};

/// Bounds how often a conflicting transaction is re-run.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError<E> {
    /// The transaction body returned an error; nothing was written.
    #[error(transparent)]
    Aborted(E),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Transaction still conflicting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Reads and buffered writes of one transaction attempt.
///
/// All reads must precede the first write. Writes become visible only when
/// the attempt commits, and then all together.
pub struct Transaction {
    handle: Box<dyn TransactionHandle>,
    writes: Vec<Write>,
}

impl Transaction {
    fn new(handle: Box<dyn TransactionHandle>) -> Self {
        Self {
            handle,
            writes: Vec::new(),
        }
    }

    pub async fn get(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        if !self.writes.is_empty() {
            return Err(StoreError::ReadAfterWrite);
        }
        self.handle.read(path).await
    }

    pub fn set(&mut self, path: &DocumentPath, data: Fields) {
        self.writes.push(Write::Set {
            path: path.clone(),
            data,
            server_timestamps: Vec::new(),
        });
    }

    /// Like [`Transaction::set`], with `field` stamped by the store at commit time.
    pub fn set_with_server_timestamp(&mut self, path: &DocumentPath, data: Fields, field: &str) {
        self.writes.push(Write::Set {
            path: path.clone(),
            data,
            server_timestamps: vec![field.to_string()],
        });
    }

    pub fn update(&mut self, path: &DocumentPath, data: Fields) {
        self.writes.push(Write::Update {
            path: path.clone(),
            data,
        });
    }

    pub fn delete(&mut self, path: &DocumentPath) {
        self.writes.push(Write::Delete { path: path.clone() });
    }

    async fn commit(self) -> Result<CommitOutcome, StoreError> {
        self.handle.commit(self.writes).await
    }
}

/// Runs `body` inside an optimistic transaction.
///
/// Every attempt starts from fresh reads. When the commit reports a conflict the
/// body runs again, up to `policy.max_attempts` times in total.
pub async fn run_transaction<T, E, F>(
    store: &dyn DocumentStore,
    policy: &RetryPolicy,
    mut body: F,
) -> Result<T, TransactionError<E>>
where
    F: for<'t> FnMut(&'t mut Transaction) -> BoxFuture<'t, Result<T, E>> + Send,
    T: Send,
    E: Send,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let mut transaction = Transaction::new(store.begin().await?);
        let value = body(&mut transaction)
            .await
            .map_err(TransactionError::Aborted)?;

        match transaction.commit().await? {
            CommitOutcome::Committed => return Ok(value),
            CommitOutcome::Conflict if attempt < max_attempts => {
                let backoff = policy.backoff(attempt);
                debug!(
                    "Transaction conflict on attempt {}/{}, retrying in {:?}",
                    attempt, max_attempts, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            CommitOutcome::Conflict => {
                debug!("Transaction conflict on final attempt {}", attempt);
            }
        }
    }

    Err(TransactionError::Exhausted {
        attempts: max_attempts,
    })
}
