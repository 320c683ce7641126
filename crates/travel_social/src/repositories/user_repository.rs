use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::{
    models::{
        user_follows::{FollowMarker, FollowState, FOLLOWED_AT_FIELD},
        users::{FollowCounters, NewUser, UserAccount},
    },
    store::{
        run_transaction, to_fields, Document, DocumentPath, DocumentStore, Fields, RetryPolicy,
        StoreError, TransactionError,
    },
    utils::document_paths::DocumentPaths,
};

#[derive(Debug, thiserror::Error)]
pub enum UserRepositoryError {
    #[error("User {0} does not exist")]
    UserNotFound(String),

    #[error("Transaction still conflicting after {attempts} attempts")]
    Contended { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TransactionError<UserRepositoryError>> for UserRepositoryError {
    fn from(err: TransactionError<UserRepositoryError>) -> Self {
        match err {
            TransactionError::Aborted(err) => err,
            TransactionError::Store(err) => err.into(),
            TransactionError::Exhausted { attempts } => UserRepositoryError::Contended { attempts },
        }
    }
}

pub struct UserRepository {
    store: Arc<dyn DocumentStore>,
}

fn decode_user(document: &Document) -> Result<UserAccount, StoreError> {
    let mut user: UserAccount = document.decode()?;
    if user.id.is_empty() {
        user.id = document.id().to_string();
    }
    Ok(user)
}

/// An id that cannot name a document cannot name an existing user either.
fn user_path(user_id: &str) -> Result<DocumentPath, UserRepositoryError> {
    DocumentPaths::user(user_id)
        .map_err(|_| UserRepositoryError::UserNotFound(user_id.to_string()))
}

fn decode_counters(
    document: Option<&Document>,
    path: &DocumentPath,
) -> Result<FollowCounters, UserRepositoryError> {
    let document =
        document.ok_or_else(|| UserRepositoryError::UserNotFound(path.id().to_string()))?;
    Ok(document.decode()?)
}

fn counter_fields(field: &str, value: u64) -> Fields {
    let mut fields = Fields::new();
    fields.insert(field.to_string(), Value::from(value));
    fields
}

impl UserRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        UserRepository { store }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<UserAccount>, StoreError> {
        let path = DocumentPaths::user(id)?;
        self.store
            .get(&path)
            .await?
            .map(|document| decode_user(&document))
            .transpose()
    }

    /// Creates `users/{id}` unless it already exists; returns the stored profile.
    pub async fn create_if_absent(
        &self,
        id: &str,
        user: NewUser,
        policy: &RetryPolicy,
    ) -> Result<UserAccount, TransactionError<StoreError>> {
        let path = DocumentPaths::user(id)?;
        let account = user.into_account(id);

        run_transaction(self.store.as_ref(), policy, |tx| {
            let path = path.clone();
            let account = account.clone();
            Box::pin(async move {
                if let Some(existing) = tx.get(&path).await? {
                    return decode_user(&existing);
                }
                tx.set(&path, to_fields(&account)?);
                Ok(account)
            })
        })
        .await
    }

    pub async fn marker_exists(
        &self,
        target_user_id: &str,
        follower_user_id: &str,
    ) -> Result<bool, StoreError> {
        let path = DocumentPaths::follower(target_user_id, follower_user_id)?;
        Ok(self.store.get(&path).await?.is_some())
    }

    pub async fn watch_marker(
        &self,
        target_user_id: &str,
        follower_user_id: &str,
    ) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        let path = DocumentPaths::follower(target_user_id, follower_user_id)?;
        self.store.watch(&path).await
    }

    /// Follower markers of a user, newest first.
    pub async fn list_followers(
        &self,
        target_user_id: &str,
    ) -> Result<Vec<(String, FollowMarker)>, StoreError> {
        let collection = DocumentPaths::followers(target_user_id)?;
        let mut followers = self
            .store
            .list(&collection)
            .await?
            .into_iter()
            .map(|document| {
                let marker: FollowMarker = document.decode()?;
                Ok((document.id().to_string(), marker))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        followers.sort_by(|a, b| b.1.followed_at.cmp(&a.1.followed_at));
        Ok(followers)
    }

    /// Flips the follow relationship inside one transaction: reads both accounts
    /// and the marker, then writes the marker and both counters together.
    pub async fn toggle_follow(
        &self,
        target_user_id: &str,
        follower_user_id: &str,
        policy: &RetryPolicy,
    ) -> Result<FollowState, UserRepositoryError> {
        let follower_path = user_path(follower_user_id)?;
        let target_path = user_path(target_user_id)?;
        let marker_path = DocumentPaths::follower(target_user_id, follower_user_id)?;

        let next = run_transaction(self.store.as_ref(), policy, |tx| {
            let follower_path = follower_path.clone();
            let target_path = target_path.clone();
            let marker_path = marker_path.clone();
            Box::pin(async move {
                let follower_doc = tx.get(&follower_path).await?;
                let target_doc = tx.get(&target_path).await?;
                let marker_doc = tx.get(&marker_path).await?;

                let follower = decode_counters(follower_doc.as_ref(), &follower_path)?;
                let target = decode_counters(target_doc.as_ref(), &target_path)?;

                let next = FollowState::from_marker_exists(marker_doc.is_some()).toggled();
                match next {
                    FollowState::Following => {
                        tx.set_with_server_timestamp(
                            &marker_path,
                            Fields::new(),
                            FOLLOWED_AT_FIELD,
                        );
                        tx.update(
                            &target_path,
                            counter_fields("followers", target.followers.saturating_add(1)),
                        );
                        tx.update(
                            &follower_path,
                            counter_fields("following", follower.following.saturating_add(1)),
                        );
                    }
                    FollowState::NotFollowing => {
                        tx.delete(&marker_path);
                        // Counters never go below zero, even if they had drifted.
                        tx.update(
                            &target_path,
                            counter_fields("followers", target.followers.saturating_sub(1)),
                        );
                        tx.update(
                            &follower_path,
                            counter_fields("following", follower.following.saturating_sub(1)),
                        );
                    }
                }
                Ok::<_, UserRepositoryError>(next)
            })
        })
        .await?;

        Ok(next)
    }

    /// Rewrites `followers` of a user from the number of markers under it.
    /// Returns the stored value and the counted value.
    pub async fn recount_followers(
        &self,
        target_user_id: &str,
        policy: &RetryPolicy,
    ) -> Result<(u64, u64), UserRepositoryError> {
        let target_path = user_path(target_user_id)?;
        let collection = DocumentPaths::followers(target_user_id)?;
        let store = self.store.clone();

        let counts = run_transaction(self.store.as_ref(), policy, |tx| {
            let target_path = target_path.clone();
            let collection = collection.clone();
            let store = store.clone();
            Box::pin(async move {
                let target_doc = tx.get(&target_path).await?;
                let previous = decode_counters(target_doc.as_ref(), &target_path)?.followers;

                // Read every marker through the transaction so that a concurrent
                // follow or unfollow of a listed marker forces a retry.
                let mut counted = 0u64;
                for marker in store.list(&collection).await? {
                    if tx.get(&marker.path).await?.is_some() {
                        counted += 1;
                    }
                }

                if counted != previous {
                    tx.update(&target_path, counter_fields("followers", counted));
                }
                Ok::<_, UserRepositoryError>((previous, counted))
            })
        })
        .await?;

        Ok(counts)
    }
}
