use serde::{Deserialize, Serialize};

/// Verified caller identity, resolved from a bearer token issued by the
/// identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: String,
    #[serde(default)]
    pub is_admin: bool,
}
