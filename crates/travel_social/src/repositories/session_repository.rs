use std::sync::Arc;

use crate::{
    models::sessions::Session,
    store::{to_fields, DocumentStore, StoreError},
    utils::document_paths::DocumentPaths,
};

/// Session documents written by the identity provider, keyed by bearer token.
pub struct SessionRepository {
    store: Arc<dyn DocumentStore>,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        SessionRepository { store }
    }

    pub async fn find_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
        let path = DocumentPaths::session(token)?;
        self.store
            .get(&path)
            .await?
            .map(|document| document.decode::<Session>())
            .transpose()
    }

    pub async fn save(&self, token: &str, session: &Session) -> Result<(), StoreError> {
        let path = DocumentPaths::session(token)?;
        self.store.set(&path, to_fields(session)?).await
    }
}
