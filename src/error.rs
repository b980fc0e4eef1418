use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(format!("Database error: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("Migration error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// The chain head kept moving under the writer until the retry budget ran out.
    #[error("Chain write conflict for organization {organization_id} after {attempts} attempts")]
    ChainWriteConflict {
        organization_id: String,
        attempts: u32,
    },

    #[error("Chain broken for organization {organization_id} at sequence {sequence}: {detail}")]
    ChainBroken {
        organization_id: String,
        sequence: i64,
        detail: String,
    },

    #[error("Anchor sink unavailable: {0}")]
    AnchorSinkUnavailable(String),

    #[error("Malformed proof: {0}")]
    MalformedProof(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Event {0} is not covered by a root anchor yet")]
    EventNotAnchored(String),

    /// Another writer already anchored (part of) the range.
    #[error("Anchor conflict: {0}")]
    AnchorConflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Verification timed out after {0} ms")]
    VerificationTimeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn malformed_proof(msg: impl Into<String>) -> Self {
        Self::MalformedProof(msg.into())
    }

    /// Integrity violations are never retried and never auto-repaired.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::ChainBroken { .. } | Self::MalformedProof(_))
    }
}
