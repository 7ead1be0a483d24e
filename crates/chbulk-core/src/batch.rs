use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unit of delivery and of durable persistence.
///
/// Content is immutable once formed; retries never mutate it, only the
/// retry counter and the chosen node change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBatch {
    /// Raw destination query string, including the statement prefix in its
    /// `query=` parameter plus table/database/user/password parameters.
    pub params: String,
    /// Serialized batch body: row fragments joined after the shared prefix.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
}

impl PendingBatch {
    pub fn new(params: String, content: String) -> Self {
        Self {
            params,
            content,
            created_at: Utc::now(),
            retries: 0,
        }
    }
}
