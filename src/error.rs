use thiserror::Error;

/// Error taxonomy for the contact sync core (spec §7).
///
/// Each variant is a *kind*, not a message: callers pattern-match on the
/// variant rather than parsing prose, and the engine's progress callback
/// renders structured step text from the variant plus its payload.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("sqlite: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("auth: {0}")]
    Auth(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict on {contact_id}: local hash {local_hash} != remote hash {remote_hash}")]
    Conflict {
        contact_id: String,
        local_hash: String,
        remote_hash: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("validation: {0}")]
    Validation(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
