use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::{Evidence, UserIdentity};

/// Where a verification request currently is in its lifecycle.
///
/// `Created` and `AwaitingEvidence` are entry states: the OAuth path decides
/// straight from `Created`, the document path collects evidence first.
/// `Accepted` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    AwaitingEvidence,
    InReview,
    Accepted,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Accepted | RequestState::Rejected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::AwaitingEvidence => "awaiting_evidence",
            RequestState::InReview => "in_review",
            RequestState::Accepted => "accepted",
            RequestState::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One in-flight verification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub id: Uuid,

    pub identity: UserIdentity,

    /// Single-use secret correlating external callbacks (the link the user
    /// receives embeds this, not the request id)
    pub secret_code: String,

    pub state: RequestState,

    /// Submitted documents, present once the user uploads them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,

    /// Reviewer who decided this request, if decided manually
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<Uuid>,

    /// The trusted record created on acceptance. Nullified if that record
    /// is later deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,

    /// Write version for optimistic concurrency. Every committed update
    /// increments this; writers supply the version they read.
    pub version: u64,
}

impl VerificationRequest {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            secret_code: generate_secret(),
            state: RequestState::Created,
            evidence: None,
            reviewer: None,
            trust: None,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Random URL-safe secret for verification links.
///
/// Two UUIDs worth of entropy, base64url without padding so it can sit in a
/// path segment.
fn generate_secret() -> String {
    use base64::Engine;

    let mut raw = [0u8; 32];
    raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_starts_created() {
        let request = VerificationRequest::new(UserIdentity::new(1, 42));

        assert_eq!(request.state, RequestState::Created);
        assert_eq!(request.version, 0);
        assert!(request.is_active());
        assert!(request.evidence.is_none());
        assert!(request.trust.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RequestState::Accepted.is_terminal());
        assert!(RequestState::Rejected.is_terminal());
        assert!(!RequestState::Created.is_terminal());
        assert!(!RequestState::AwaitingEvidence.is_terminal());
        assert!(!RequestState::InReview.is_terminal());
    }

    #[test]
    fn test_secrets_are_unique_and_url_safe() {
        let a = generate_secret();
        let b = generate_secret();

        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
