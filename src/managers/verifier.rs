use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Result, VerificationError};
use crate::state::{student_number_from_email, IdentityStore, UserIdentity};

/// Claim set for a bearer assertion, as returned by the issuer's token-info
/// endpoint. The endpoint already checked the signature; everything else is
/// validated here.
#[derive(Debug, Clone)]
pub struct OAuthAssertion {
    pub claims: serde_json::Map<String, Value>,
}

impl OAuthAssertion {
    pub fn new(claims: serde_json::Map<String, Value>) -> Self {
        Self { claims }
    }

    fn str_claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(|v| v.as_str())
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        // Token-info endpoints return exp either as a number or a decimal
        // string depending on provider
        let raw = self.claims.get("exp")?;
        let seconds = match raw {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.parse::<i64>().ok()?,
            _ => return None,
        };
        Utc.timestamp_opt(seconds, 0).single()
    }
}

/// The accepted output of a verifier: a stable subject plus the derived
/// student number.
#[derive(Debug, Clone)]
pub struct VerifiedSubject {
    pub subject: String,
    pub email: String,
    pub student_number: String,
    pub claims: serde_json::Map<String, Value>,
}

/// Validates OAuth assertions against a fixed issuer and client id.
///
/// Every validation failure is a classified `InvalidAssertion`; a
/// structurally valid token whose email cannot yield a student number is an
/// `AssertionRejected` (policy, not validity).
#[derive(Debug, Clone)]
pub struct OAuthVerifier {
    pub issuer: String,
    pub client_id: String,
}

impl OAuthVerifier {
    pub fn new(issuer: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
        }
    }

    pub fn verify(&self, assertion: &OAuthAssertion, now: DateTime<Utc>) -> Result<VerifiedSubject> {
        let issuer = assertion
            .str_claim("iss")
            .ok_or_else(|| invalid("missing issuer claim"))?;
        if issuer != self.issuer {
            return Err(invalid(&format!("unexpected issuer '{}'", issuer)));
        }

        let audience = assertion
            .str_claim("aud")
            .ok_or_else(|| invalid("missing audience claim"))?;
        if audience != self.client_id {
            return Err(invalid("audience does not match client id"));
        }

        let expiry = assertion
            .expiry()
            .ok_or_else(|| invalid("missing or malformed expiry claim"))?;
        if expiry <= now {
            return Err(invalid(&format!("assertion expired at {}", expiry)));
        }

        let subject = assertion
            .str_claim("sub")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing subject claim"))?
            .to_string();

        let email = assertion
            .str_claim("email")
            .filter(|e| e.contains('@'))
            .ok_or_else(|| invalid("missing or malformed email claim"))?
            .to_string();

        let student_number = student_number_from_email(&email).ok_or_else(|| {
            VerificationError::AssertionRejected {
                reason: format!("email '{}' does not carry a student number", email),
            }
        })?;

        Ok(VerifiedSubject {
            subject,
            email,
            student_number,
            claims: assertion.claims.clone(),
        })
    }
}

fn invalid(reason: &str) -> VerificationError {
    VerificationError::InvalidAssertion {
        reason: reason.to_string(),
    }
}

/// Authorization lookup for manual decisions: the acting user must be on the
/// reviewer roster for the request's guild. No cryptography involved.
pub struct ReviewVerifier;

impl ReviewVerifier {
    pub fn authorize(
        store: &IdentityStore,
        guild_id: u64,
        user_id: u64,
    ) -> Result<uuid::Uuid> {
        store
            .reviewer_by_user(guild_id, user_id)
            .map(|r| r.id)
            .ok_or(VerificationError::Unauthorized { guild_id, user_id })
    }
}

/// Duplicate-prevention check shared by both verifier variants: reject when
/// the identity or student number is already bound to a trusted record. Runs
/// before the state machine commits (the store enforces the same invariants
/// again at write time).
pub fn ensure_no_conflict(
    store: &IdentityStore,
    identity: &UserIdentity,
    student_number: Option<&str>,
) -> Result<()> {
    if let Some(existing) = store.trusted_for_identity(identity) {
        return Err(VerificationError::IdentityConflict {
            detail: format!(
                "user {} in guild {} is already trusted (record {})",
                identity.user_id, identity.guild_id, existing.id
            ),
        });
    }
    if let Some(number) = student_number {
        if let Some(existing) = store.trusted_by_student_number(number) {
            return Err(VerificationError::IdentityConflict {
                detail: format!(
                    "student number {} is already bound to record {}",
                    number, existing.id
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Reviewer, TrustedRecord, VerificationMethod};
    use chrono::Duration;

    fn verifier() -> OAuthVerifier {
        OAuthVerifier::new("https://accounts.example.com", "client-123")
    }

    fn claims(email: &str, exp: DateTime<Utc>) -> OAuthAssertion {
        let mut map = serde_json::Map::new();
        map.insert("iss".into(), "https://accounts.example.com".into());
        map.insert("aud".into(), "client-123".into());
        map.insert("sub".into(), "abc123".into());
        map.insert("email".into(), email.into());
        map.insert("exp".into(), serde_json::json!(exp.timestamp()));
        OAuthAssertion::new(map)
    }

    #[test]
    fn test_valid_assertion_yields_subject_and_student_number() {
        let now = Utc::now();
        let subject = verifier()
            .verify(&claims("s12345@test", now + Duration::hours(1)), now)
            .unwrap();

        assert_eq!(subject.subject, "abc123");
        assert_eq!(subject.student_number, "s12345");
        assert_eq!(subject.email, "s12345@test");
    }

    #[test]
    fn test_expired_assertion_is_invalid() {
        let now = Utc::now();
        let err = verifier()
            .verify(&claims("s12345@test", now - Duration::minutes(1)), now)
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidAssertion { .. }));
    }

    #[test]
    fn test_wrong_audience_is_invalid() {
        let now = Utc::now();
        let mut assertion = claims("s12345@test", now + Duration::hours(1));
        assertion
            .claims
            .insert("aud".into(), "someone-else".into());

        let err = verifier().verify(&assertion, now).unwrap_err();
        assert!(matches!(err, VerificationError::InvalidAssertion { .. }));
    }

    #[test]
    fn test_wrong_issuer_is_invalid() {
        let now = Utc::now();
        let mut assertion = claims("s12345@test", now + Duration::hours(1));
        assertion
            .claims
            .insert("iss".into(), "https://evil.example.com".into());

        let err = verifier().verify(&assertion, now).unwrap_err();
        assert!(matches!(err, VerificationError::InvalidAssertion { .. }));
    }

    #[test]
    fn test_missing_subject_is_invalid() {
        let now = Utc::now();
        let mut assertion = claims("s12345@test", now + Duration::hours(1));
        assertion.claims.remove("sub");

        let err = verifier().verify(&assertion, now).unwrap_err();
        assert!(matches!(err, VerificationError::InvalidAssertion { .. }));
    }

    #[test]
    fn test_non_student_email_is_policy_rejection() {
        let now = Utc::now();
        let err = verifier()
            .verify(&claims("alice@test", now + Duration::hours(1)), now)
            .unwrap_err();
        assert!(matches!(err, VerificationError::AssertionRejected { .. }));
    }

    #[test]
    fn test_string_expiry_accepted() {
        let now = Utc::now();
        let mut assertion = claims("s12345@test", now);
        assertion.claims.insert(
            "exp".into(),
            Value::String((now + Duration::hours(1)).timestamp().to_string()),
        );

        assert!(verifier().verify(&assertion, now).is_ok());
    }

    #[test]
    fn test_review_verifier_checks_roster() {
        let mut store = IdentityStore::new();
        let reviewer = Reviewer::new(UserIdentity::new(1, 7));
        let reviewer_id = reviewer.id;
        store.reviewers.insert(reviewer_id, reviewer);

        assert_eq!(
            ReviewVerifier::authorize(&store, 1, 7).unwrap(),
            reviewer_id
        );
        let err = ReviewVerifier::authorize(&store, 1, 8).unwrap_err();
        assert!(matches!(err, VerificationError::Unauthorized { .. }));
    }

    #[test]
    fn test_conflict_on_bound_identity_or_number() {
        let mut store = IdentityStore::new();
        let record = TrustedRecord::new(UserIdentity::new(1, 42), VerificationMethod::Oauth)
            .with_student_number("s12345");
        store.trusted.insert(record.id, record);

        let err =
            ensure_no_conflict(&store, &UserIdentity::new(1, 42), None).unwrap_err();
        assert!(matches!(err, VerificationError::IdentityConflict { .. }));

        let err = ensure_no_conflict(&store, &UserIdentity::new(1, 99), Some("s12345"))
            .unwrap_err();
        assert!(matches!(err, VerificationError::IdentityConflict { .. }));

        assert!(ensure_no_conflict(&store, &UserIdentity::new(1, 99), Some("s99999")).is_ok());
    }
}
