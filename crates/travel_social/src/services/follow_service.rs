use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    models::{
        sessions::Session,
        user_follows::{FollowState, FollowStatus, RecountResponse},
    },
    repositories::user_repository::{UserRepository, UserRepositoryError},
    store::RetryPolicy,
    utils::errors::app_error::AppError,
};

pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Maintains the follow relationship between two users: the marker document
/// `users/{target}/followers/{follower}` plus the `followers` counter of the
/// target and the `following` counter of the follower.
#[derive(Clone)]
pub struct FollowService {
    user_repository: Arc<UserRepository>,
    retry_policy: RetryPolicy,
    status_timeout: Duration,
}

fn follow_error(err: UserRepositoryError) -> AppError {
    match err {
        UserRepositoryError::UserNotFound(id) => AppError::NotFound(format!("User {}", id)),
        UserRepositoryError::Contended { attempts } => AppError::TransactionConflict(attempts),
        UserRepositoryError::Store(err) => err.into(),
    }
}

/// Ids for which the existence check can be resolved. Absent ids and a user
/// looking at themselves stay indeterminate.
fn resolvable_pair<'a>(
    target_user_id: Option<&'a str>,
    follower_user_id: Option<&'a str>,
) -> Option<(&'a str, &'a str)> {
    match (target_user_id, follower_user_id) {
        (Some(target), Some(follower)) if target != follower => Some((target, follower)),
        _ => None,
    }
}

impl FollowService {
    pub fn new(
        user_repository: Arc<UserRepository>,
        retry_policy: RetryPolicy,
        status_timeout: Duration,
    ) -> Self {
        Self {
            user_repository,
            retry_policy,
            status_timeout,
        }
    }

    /// Flips whether the caller follows `target_user_id` and returns `true` when
    /// the caller now follows the target.
    ///
    /// Either the marker and both counters change together or nothing changes.
    pub async fn toggle_follow(
        &self,
        caller: Option<&Session>,
        target_user_id: &str,
    ) -> Result<bool, AppError> {
        let follower_user_id = caller
            .map(|session| session.user_id.as_str())
            .ok_or_else(|| {
                AppError::Unauthenticated("You must be logged in to follow users".to_string())
            })?;

        if follower_user_id == target_user_id {
            return Err(AppError::InvalidOperation(
                "You cannot follow yourself".to_string(),
            ));
        }

        let state = self
            .user_repository
            .toggle_follow(target_user_id, follower_user_id, &self.retry_policy)
            .await
            .map_err(follow_error)
            .map_err(|e| {
                match &e {
                    AppError::NotFound(message) => warn!(
                        "Follow toggle {} -> {} references a missing account: {}",
                        follower_user_id, target_user_id, message
                    ),
                    AppError::TransactionConflict(attempts) => debug!(
                        "Follow toggle {} -> {} still conflicting after {} attempts",
                        follower_user_id, target_user_id, attempts
                    ),
                    other => error!(
                        "Follow toggle {} -> {} failed: {}",
                        follower_user_id, target_user_id, other
                    ),
                }
                e
            })?;

        info!(
            "User {} {} user {}",
            follower_user_id,
            match state {
                FollowState::Following => "followed",
                FollowState::NotFollowing => "unfollowed",
            },
            target_user_id
        );
        Ok(state.is_following())
    }

    /// One-shot answer to "does the follower follow the target?".
    pub async fn follow_status(
        &self,
        target_user_id: Option<&str>,
        follower_user_id: Option<&str>,
    ) -> Result<FollowStatus, AppError> {
        let Some((target, follower)) = resolvable_pair(target_user_id, follower_user_id) else {
            return Ok(FollowStatus::LOADING);
        };

        let exists = tokio::time::timeout(
            self.status_timeout,
            self.user_repository.marker_exists(target, follower),
        )
        .await
        .map_err(|_| self.status_timed_out(target, follower))??;

        Ok(FollowStatus::resolved(exists))
    }

    /// Live follow status, updated on every change of the marker document.
    ///
    /// For an indeterminate pair the receiver holds [`FollowStatus::LOADING`] and
    /// never changes.
    pub async fn watch_follow_status(
        &self,
        target_user_id: Option<&str>,
        follower_user_id: Option<&str>,
    ) -> Result<watch::Receiver<FollowStatus>, AppError> {
        let Some((target, follower)) = resolvable_pair(target_user_id, follower_user_id) else {
            let (_, receiver) = watch::channel(FollowStatus::LOADING);
            return Ok(receiver);
        };

        let mut markers = tokio::time::timeout(
            self.status_timeout,
            self.user_repository.watch_marker(target, follower),
        )
        .await
        .map_err(|_| self.status_timed_out(target, follower))??;

        let initial = FollowStatus::resolved(markers.borrow_and_update().is_some());
        let (sender, receiver) = watch::channel(initial);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sender.closed() => break,
                    changed = markers.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = FollowStatus::resolved(markers.borrow_and_update().is_some());
                        sender.send_if_modified(|current| {
                            let modified = *current != status;
                            *current = status;
                            modified
                        });
                    }
                }
            }
        });

        Ok(receiver)
    }

    /// Recomputes the `followers` counter of a user from its markers.
    pub async fn recount_followers(
        &self,
        caller: Option<&Session>,
        target_user_id: &str,
    ) -> Result<RecountResponse, AppError> {
        let caller = caller.ok_or_else(|| {
            AppError::Unauthenticated("You must be logged in to repair counters".to_string())
        })?;
        if !caller.is_admin {
            return Err(AppError::Forbidden("Admin access required".to_string()));
        }

        let (previous, counted) = self
            .user_repository
            .recount_followers(target_user_id, &self.retry_policy)
            .await
            .map_err(follow_error)?;

        if previous != counted {
            warn!(
                "Follower counter of {} drifted: stored {}, counted {}",
                target_user_id, previous, counted
            );
        }

        Ok(RecountResponse {
            user_id: target_user_id.to_string(),
            previous,
            counted,
        })
    }

    fn status_timed_out(&self, target: &str, follower: &str) -> AppError {
        error!(
            "Follow status {} -> {} not resolved within {:?}",
            follower, target, self.status_timeout
        );
        AppError::StoreUnavailable(format!(
            "Follow status not resolved within {:?}",
            self.status_timeout
        ))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        store::{
            to_fields, CollectionPath, CommitOutcome, Document, DocumentPath, DocumentStore,
            MemoryStore, StoreError, TransactionHandle, Write,
        },
        utils::document_paths::DocumentPaths,
    };

    #[derive(Clone, Copy)]
    enum Fault {
        HangingReads,
        ConflictingCommits,
        UnavailableReads,
    }

    /// Shares state with a healthy `MemoryStore` but misbehaves in one way.
    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
    }

    struct FaultyTransaction {
        inner: Box<dyn TransactionHandle>,
        fault: Fault,
    }

    #[async_trait]
    impl TransactionHandle for FaultyTransaction {
        async fn read(&mut self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
            match self.fault {
                Fault::UnavailableReads => {
                    Err(StoreError::Unavailable("connection reset".to_string()))
                }
                _ => self.inner.read(path).await,
            }
        }

        async fn commit(self: Box<Self>, writes: Vec<Write>) -> Result<CommitOutcome, StoreError> {
            match self.fault {
                Fault::ConflictingCommits => Ok(CommitOutcome::Conflict),
                _ => self.inner.commit(writes).await,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FaultyStore {
        async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
            if let Fault::HangingReads = self.fault {
                std::future::pending::<()>().await;
            }
            self.inner.get(path).await
        }

        async fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>, StoreError> {
            self.inner.list(collection).await
        }

        async fn begin(&self) -> Result<Box<dyn TransactionHandle>, StoreError> {
            Ok(Box::new(FaultyTransaction {
                inner: self.inner.begin().await?,
                fault: self.fault,
            }))
        }

        async fn watch(
            &self,
            path: &DocumentPath,
        ) -> Result<watch::Receiver<Option<Document>>, StoreError> {
            self.inner.watch(path).await
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        service: FollowService,
    }

    impl Fixture {
        fn new(policy: RetryPolicy) -> Self {
            let store = Arc::new(MemoryStore::new());
            let repository = Arc::new(UserRepository::new(store.clone()));
            let service = FollowService::new(repository, policy, Duration::from_secs(1));
            Self { store, service }
        }

        /// The service runs on a faulty view of `store`; the fixture helpers
        /// still see the real contents.
        fn faulty(fault: Fault, status_timeout: Duration) -> Self {
            let store = Arc::new(MemoryStore::new());
            let faulty = FaultyStore {
                inner: (*store).clone(),
                fault,
            };
            let repository = Arc::new(UserRepository::new(Arc::new(faulty)));
            let service = FollowService::new(repository, RetryPolicy::default(), status_timeout);
            Self { store, service }
        }

        async fn user(&self, id: &str, followers: u64, following: u64) {
            let path = DocumentPaths::user(id).unwrap();
            let data = to_fields(&json!({
                "id": id,
                "name": id,
                "followers": followers,
                "following": following,
            }))
            .unwrap();
            self.store.set(&path, data).await.unwrap();
        }

        async fn counters(&self, id: &str) -> (u64, u64) {
            let path = DocumentPaths::user(id).unwrap();
            let doc = self.store.get(&path).await.unwrap().unwrap();
            (
                doc.data["followers"].as_u64().unwrap(),
                doc.data["following"].as_u64().unwrap(),
            )
        }

        async fn marker_exists(&self, target: &str, follower: &str) -> bool {
            let path = DocumentPaths::follower(target, follower).unwrap();
            self.store.get(&path).await.unwrap().is_some()
        }
    }

    fn session(user_id: &str) -> Session {
        Session {
            user_id: user_id.to_string(),
            is_admin: false,
        }
    }

    fn admin() -> Session {
        Session {
            user_id: "admin".to_string(),
            is_admin: true,
        }
    }

    #[tokio::test]
    async fn follow_then_unfollow_restores_counters() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 2, 5).await;
        fixture.user("bob", 10, 3).await;
        let alice = session("alice");

        let following = fixture
            .service
            .toggle_follow(Some(&alice), "bob")
            .await
            .unwrap();
        assert!(following);
        assert!(fixture.marker_exists("bob", "alice").await);
        assert_eq!(fixture.counters("bob").await, (11, 3));
        assert_eq!(fixture.counters("alice").await, (2, 6));

        let following = fixture
            .service
            .toggle_follow(Some(&alice), "bob")
            .await
            .unwrap();
        assert!(!following);
        assert!(!fixture.marker_exists("bob", "alice").await);
        assert_eq!(fixture.counters("bob").await, (10, 3));
        assert_eq!(fixture.counters("alice").await, (2, 5));
    }

    #[tokio::test]
    async fn marker_records_follow_time() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;
        fixture.user("bob", 0, 0).await;

        fixture
            .service
            .toggle_follow(Some(&session("alice")), "bob")
            .await
            .unwrap();

        let path = DocumentPaths::follower("bob", "alice").unwrap();
        let marker = fixture.store.get(&path).await.unwrap().unwrap();
        assert!(marker.data["followedAt"].is_string());
    }

    #[tokio::test]
    async fn self_follow_is_rejected_without_writes() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 2, 5).await;

        let result = fixture
            .service
            .toggle_follow(Some(&session("alice")), "alice")
            .await;

        assert!(matches!(result, Err(AppError::InvalidOperation(_))));
        assert!(!fixture.marker_exists("alice", "alice").await);
        assert_eq!(fixture.counters("alice").await, (2, 5));
    }

    #[tokio::test]
    async fn missing_caller_is_unauthenticated() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("bob", 0, 0).await;

        let result = fixture.service.toggle_follow(None, "bob").await;
        assert!(matches!(result, Err(AppError::Unauthenticated(_))));
    }

    #[rstest]
    #[case("ghost", "alice")]
    #[case("alice", "ghost")]
    #[tokio::test]
    async fn missing_account_is_not_found_without_writes(
        #[case] target: &str,
        #[case] follower: &str,
    ) {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 2, 5).await;

        let result = fixture
            .service
            .toggle_follow(Some(&session(follower)), target)
            .await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert!(!fixture.marker_exists(target, follower).await);
        assert_eq!(fixture.counters("alice").await, (2, 5));
    }

    #[tokio::test]
    async fn unfollow_never_drives_counters_negative() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;
        fixture.user("bob", 0, 0).await;
        // A marker whose counters were never incremented.
        let marker = DocumentPaths::follower("bob", "alice").unwrap();
        fixture
            .store
            .set(&marker, serde_json::Map::new())
            .await
            .unwrap();

        let following = fixture
            .service
            .toggle_follow(Some(&session("alice")), "bob")
            .await
            .unwrap();

        assert!(!following);
        assert_eq!(fixture.counters("bob").await, (0, 0));
        assert_eq!(fixture.counters("alice").await, (0, 0));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(7)]
    #[case(8)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_toggles_never_lose_updates(#[case] toggles: u32) {
        // Each failed attempt is caused by another toggle committing, so a
        // budget above the number of toggles lets every one of them succeed.
        let policy = RetryPolicy::default().with_max_attempts(toggles + 1);
        let fixture = Fixture::new(policy);
        fixture.user("alice", 2, 5).await;
        fixture.user("bob", 10, 3).await;

        let handles: Vec<_> = (0..toggles)
            .map(|_| {
                let service = fixture.service.clone();
                tokio::spawn(async move {
                    service
                        .toggle_follow(Some(&session("alice")), "bob")
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let following = toggles % 2 == 1;
        let delta = u64::from(following);
        assert_eq!(fixture.marker_exists("bob", "alice").await, following);
        assert_eq!(fixture.counters("bob").await, (10 + delta, 3));
        assert_eq!(fixture.counters("alice").await, (2, 5 + delta));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_toggles_on_disjoint_pairs_keep_counters_consistent() {
        let fixture = Fixture::new(RetryPolicy::default().with_max_attempts(20));
        let users = ["alice", "bob", "carol", "dave"];
        for user in users {
            fixture.user(user, 0, 0).await;
        }

        let mut handles = Vec::new();
        for follower in users {
            for target in users.iter().filter(|target| **target != follower) {
                let service = fixture.service.clone();
                let target = target.to_string();
                handles.push(tokio::spawn(async move {
                    service
                        .toggle_follow(Some(&session(follower)), &target)
                        .await
                }));
            }
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        for user in users {
            let followers = fixture
                .store
                .list(&DocumentPaths::followers(user).unwrap())
                .await
                .unwrap()
                .len() as u64;
            assert_eq!(followers, 3);
            assert_eq!(fixture.counters(user).await, (3, 3));
        }
    }

    #[tokio::test]
    async fn follow_status_distinguishes_loading_from_not_following() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;
        fixture.user("bob", 0, 0).await;
        let service = &fixture.service;

        assert_eq!(
            service.follow_status(Some("bob"), None).await.unwrap(),
            FollowStatus::LOADING
        );
        assert_eq!(
            service.follow_status(Some("bob"), Some("bob")).await.unwrap(),
            FollowStatus::LOADING
        );
        assert_eq!(
            service.follow_status(Some("bob"), Some("alice")).await.unwrap(),
            FollowStatus::resolved(false)
        );

        service
            .toggle_follow(Some(&session("alice")), "bob")
            .await
            .unwrap();
        assert_eq!(
            service.follow_status(Some("bob"), Some("alice")).await.unwrap(),
            FollowStatus::resolved(true)
        );
    }

    #[tokio::test]
    async fn watched_status_converges_after_toggles() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;
        fixture.user("bob", 0, 0).await;
        let alice = session("alice");

        let mut status = fixture
            .service
            .watch_follow_status(Some("bob"), Some("alice"))
            .await
            .unwrap();
        assert_eq!(*status.borrow(), FollowStatus::resolved(false));

        fixture
            .service
            .toggle_follow(Some(&alice), "bob")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*status.borrow_and_update(), FollowStatus::resolved(true));

        fixture
            .service
            .toggle_follow(Some(&alice), "bob")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*status.borrow_and_update(), FollowStatus::resolved(false));
    }

    #[tokio::test]
    async fn watched_status_for_anonymous_viewer_stays_loading() {
        let fixture = Fixture::new(RetryPolicy::default());
        let status = fixture
            .service
            .watch_follow_status(Some("bob"), None)
            .await
            .unwrap();
        assert_eq!(*status.borrow(), FollowStatus::LOADING);
    }

    #[tokio::test]
    async fn recount_repairs_drifted_counter() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;
        fixture.user("carol", 0, 0).await;
        fixture.user("bob", 7, 0).await;
        for follower in ["alice", "carol"] {
            fixture
                .service
                .toggle_follow(Some(&session(follower)), "bob")
                .await
                .unwrap();
        }

        let report = fixture
            .service
            .recount_followers(Some(&admin()), "bob")
            .await
            .unwrap();

        assert_eq!(report.previous, 9);
        assert_eq!(report.counted, 2);
        assert_eq!(fixture.counters("bob").await, (2, 0));
    }

    #[tokio::test]
    async fn recount_requires_an_admin() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("bob", 7, 0).await;

        let result = fixture
            .service
            .recount_followers(Some(&session("alice")), "bob")
            .await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));

        let result = fixture.service.recount_followers(None, "bob").await;
        assert!(matches!(result, Err(AppError::Unauthenticated(_))));
        assert_eq!(fixture.counters("bob").await, (7, 0));
    }

    #[tokio::test]
    async fn follow_status_times_out_as_store_unavailable() {
        let fixture = Fixture::faulty(Fault::HangingReads, Duration::from_millis(50));

        let result = fixture.service.follow_status(Some("bob"), Some("alice")).await;

        match result {
            Err(err @ AppError::StoreUnavailable(_)) => assert!(err.is_retryable()),
            other => panic!("expected StoreUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_conflict_without_writes() {
        let fixture = Fixture::faulty(Fault::ConflictingCommits, Duration::from_secs(1));
        fixture.user("alice", 2, 5).await;
        fixture.user("bob", 10, 3).await;

        let result = fixture
            .service
            .toggle_follow(Some(&session("alice")), "bob")
            .await;

        assert!(matches!(result, Err(AppError::TransactionConflict(5))));
        assert!(!fixture.marker_exists("bob", "alice").await);
        assert_eq!(fixture.counters("bob").await, (10, 3));
        assert_eq!(fixture.counters("alice").await, (2, 5));
    }

    #[tokio::test]
    async fn unavailable_store_fails_toggle_without_writes() {
        let fixture = Fixture::faulty(Fault::UnavailableReads, Duration::from_secs(1));
        fixture.user("alice", 2, 5).await;
        fixture.user("bob", 10, 3).await;

        let result = fixture
            .service
            .toggle_follow(Some(&session("alice")), "bob")
            .await;

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
        assert!(!fixture.marker_exists("bob", "alice").await);
        assert_eq!(fixture.counters("bob").await, (10, 3));
        assert_eq!(fixture.counters("alice").await, (2, 5));
    }

    #[tokio::test]
    async fn toggle_only_depends_on_the_counters() {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;
        let bob = DocumentPaths::user("bob").unwrap();
        let data = to_fields(&json!({
            "name": 42,
            "email": { "primary": "bob@example.com" },
            "followers": -3,
            "following": 1.5,
        }))
        .unwrap();
        fixture.store.set(&bob, data).await.unwrap();

        let following = fixture
            .service
            .toggle_follow(Some(&session("alice")), "bob")
            .await
            .unwrap();
        assert!(following);
        let stored = fixture.store.get(&bob).await.unwrap().unwrap();
        assert_eq!(stored.data["followers"], json!(1));
        assert_eq!(stored.data["name"], json!(42));
        assert_eq!(fixture.counters("alice").await, (0, 1));

        let report = fixture
            .service
            .recount_followers(Some(&admin()), "bob")
            .await
            .unwrap();
        assert_eq!((report.previous, report.counted), (1, 1));
    }

    #[rstest]
    #[case("bob/followers/carol")]
    #[case("")]
    #[tokio::test]
    async fn unaddressable_target_is_not_found(#[case] target: &str) {
        let fixture = Fixture::new(RetryPolicy::default());
        fixture.user("alice", 0, 0).await;

        let result = fixture
            .service
            .toggle_follow(Some(&session("alice")), target)
            .await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(fixture.counters("alice").await, (0, 0));
    }
}
