use thiserror::Error;

/// Failures reported by a [`RemoteRuleStore`](crate::RemoteRuleStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("status: 404, body: {body}")]
    NotFound { body: String },

    /// The supplied version token no longer matches the stored one.
    #[error("version conflict (status {status}): {body}")]
    Conflict { status: u16, body: String },

    #[error("API error: status {status}, body: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("response from {endpoint} missing etag header")]
    MissingEtag { endpoint: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Failure planted through [`InMemoryRuleStore::fail_next`](crate::InMemoryRuleStore::fail_next).
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Payload problems, as opposed to transport or server failures.
    pub fn is_decode(&self) -> bool {
        matches!(self, StoreError::Decode(_) | StoreError::MissingEtag { .. })
    }
}
