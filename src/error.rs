use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerificationError {
    // State machine errors
    #[error("An active request or trusted record already exists for user {user_id} in guild {guild_id}")]
    DuplicateIdentity { guild_id: u64, user_id: u64 },

    #[error("Operation '{operation}' is not legal from state {state}")]
    InvalidState { operation: String, state: String },

    #[error("Request {request_id} has already been decided")]
    AlreadyDecided { request_id: String },

    #[error("Concurrent write on request {request_id}: expected version {expected}, found {found}")]
    Conflict {
        request_id: String,
        expected: u64,
        found: u64,
    },

    // Verifier errors
    #[error("Assertion rejected: {reason}")]
    AssertionRejected { reason: String },

    #[error("Invalid assertion: {reason}")]
    InvalidAssertion { reason: String },

    #[error("Identity already bound to an existing trusted record: {detail}")]
    IdentityConflict { detail: String },

    #[error("User {user_id} is not a registered reviewer for guild {guild_id}")]
    Unauthorized { guild_id: u64, user_id: u64 },

    // Dispatcher errors (non-fatal, surfaced to the operator log)
    #[error("External action '{action}' failed for request {request_id}: {message}")]
    ExternalActionFailed {
        request_id: String,
        action: String,
        message: String,
    },

    // Lookup errors
    #[error("Verification request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("No guild configuration for guild {guild_id}")]
    GuildNotConfigured { guild_id: u64 },

    // Storage errors (fatal, surfaced to the operator)
    #[error("Failed to save state to '{path}': {source}")]
    StateSave {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load state from '{path}': {source}")]
    StateLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Failed to load config file '{path}': {source}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    // External collaborator errors
    #[error("Discord API error: {message}")]
    Discord { message: String },

    #[error("HTTP error: {message}")]
    Http { message: String },

    // Generic errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl VerificationError {
    /// Whether a failed transition may be retried by the caller with the
    /// same inputs (the request was left unchanged).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VerificationError::AssertionRejected { .. }
                | VerificationError::InvalidAssertion { .. }
                | VerificationError::Conflict { .. }
                | VerificationError::ExternalActionFailed { .. }
        )
    }
}

impl From<serenity::Error> for VerificationError {
    fn from(err: serenity::Error) -> Self {
        VerificationError::Discord {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for VerificationError {
    fn from(err: reqwest::Error) -> Self {
        VerificationError::Http {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for VerificationError {
    fn from(err: serde_json::Error) -> Self {
        VerificationError::Internal {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VerificationError>;
