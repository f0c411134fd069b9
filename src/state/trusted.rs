use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::{UserIdentity, VerificationMethod};

/// Durable proof that a member completed verification.
///
/// Outlives the request that produced it; the request keeps a reference,
/// not the other way around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedRecord {
    pub id: Uuid,

    pub identity: UserIdentity,

    pub method: VerificationMethod,

    /// Opaque context captured at verification time (raw OAuth claims,
    /// reviewer notes). Typed only at the boundary that produced it.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: serde_json::Map<String, serde_json::Value>,

    /// Student-number token (`s` + five digits), when one was derived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_number: Option<String>,

    pub verified_at: DateTime<Utc>,
}

impl TrustedRecord {
    pub fn new(identity: UserIdentity, method: VerificationMethod) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            method,
            context: serde_json::Map::new(),
            student_number: None,
            verified_at: Utc::now(),
        }
    }

    pub fn with_student_number(mut self, student_number: impl Into<String>) -> Self {
        self.student_number = Some(student_number.into());
        self
    }

    pub fn with_context(
        mut self,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.context = context;
        self
    }
}

/// Staff member permitted to decide requests for a guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: Uuid,
    pub identity: UserIdentity,
    pub added_at: DateTime<Utc>,
}

impl Reviewer {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            added_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let mut context = serde_json::Map::new();
        context.insert("sub".to_string(), serde_json::json!("abc123"));

        let record = TrustedRecord::new(UserIdentity::new(1, 42), VerificationMethod::Oauth)
            .with_student_number("s12345")
            .with_context(context);

        assert_eq!(record.method, VerificationMethod::Oauth);
        assert_eq!(record.student_number.as_deref(), Some("s12345"));
        assert_eq!(record.context["sub"], serde_json::json!("abc123"));
    }

    #[test]
    fn test_context_omitted_when_empty() {
        let record = TrustedRecord::new(UserIdentity::new(1, 42), VerificationMethod::Migrated);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("context"));
    }
}
