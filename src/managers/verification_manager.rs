use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, VerificationError};
use crate::state::{
    Evidence, OutboxEntry, RequestState, SharedIdentityStore, TrustedRecord, UserIdentity,
    VerificationMethod, VerificationRequest,
};

use super::verifier::{ensure_no_conflict, OAuthAssertion, OAuthVerifier, ReviewVerifier};

/// A reviewer's decision on a request under review.
#[derive(Debug, Clone)]
pub enum ReviewOutcome {
    Accept {
        /// Student number read off the submitted document; when absent it is
        /// derived from the contact email
        student_number: Option<String>,
    },
    Reject {
        reason: String,
    },
}

/// The verification state machine.
///
/// Owns every transition on a request: validation happens before any write,
/// the store commits a decision together with its outbox entry, and terminal
/// states are final. All operations hold the store write lock end to end, so
/// two racing decisions serialize here and the loser sees `AlreadyDecided`
/// (or `Conflict` when it brought a stale version).
pub struct VerificationManager {
    store: SharedIdentityStore,
    oauth_verifier: OAuthVerifier,
}

impl VerificationManager {
    pub fn new(store: SharedIdentityStore, oauth_verifier: OAuthVerifier) -> Self {
        Self {
            store,
            oauth_verifier,
        }
    }

    pub fn store(&self) -> &SharedIdentityStore {
        &self.store
    }

    /// Open a new verification request for this member.
    ///
    /// Fails with `DuplicateIdentity` when the member already holds a trusted
    /// record or has an active request.
    pub async fn create(&self, identity: UserIdentity) -> Result<VerificationRequest> {
        let mut store = self.store.write().await;

        let request = VerificationRequest::new(identity);
        store.insert_request(request.clone()).await?;

        info!(
            "Opened verification request {} for user {} in guild {}",
            request.id, request.identity.user_id, request.identity.guild_id
        );
        Ok(request)
    }

    /// Ask the user for document photos: `Created -> AwaitingEvidence`,
    /// with an evidence-request DM queued through the outbox.
    pub async fn request_evidence(&self, request_id: &Uuid) -> Result<()> {
        let mut store = self.store.write().await;
        let current = get_active(&store, request_id, "request_evidence")?.clone();

        if current.state != RequestState::Created {
            return Err(VerificationError::InvalidState {
                operation: "request_evidence".to_string(),
                state: current.state.to_string(),
            });
        }

        let mut updated = current.clone();
        updated.state = RequestState::AwaitingEvidence;
        let entry = OutboxEntry::evidence_requested(
            updated.id,
            updated.identity.clone(),
            updated.secret_code.clone(),
        );

        store
            .update_request(updated, current.version, Some(entry))
            .await?;
        debug!("Request {} now awaiting evidence", request_id);
        Ok(())
    }

    /// Attach submitted documents and move to review:
    /// `Created | AwaitingEvidence -> InReview`. Reviewers for the guild get
    /// alerted through the outbox.
    pub async fn submit_evidence(&self, request_id: &Uuid, evidence: Evidence) -> Result<()> {
        let mut store = self.store.write().await;
        let current = get_active(&store, request_id, "submit_evidence")?.clone();

        if !matches!(
            current.state,
            RequestState::Created | RequestState::AwaitingEvidence
        ) {
            return Err(VerificationError::InvalidState {
                operation: "submit_evidence".to_string(),
                state: current.state.to_string(),
            });
        }

        let mut updated = current.clone();
        updated.state = RequestState::InReview;
        updated.evidence = Some(evidence);
        let entry = OutboxEntry::evidence_submitted(updated.id, updated.identity.clone());

        store
            .update_request(updated, current.version, Some(entry))
            .await?;
        info!("Request {} moved to review", request_id);
        Ok(())
    }

    /// Decide a request from an OAuth assertion: only legal from `Created`.
    ///
    /// A declined assertion leaves the request unchanged so the user can
    /// retry with a fresh token. On success the trusted record, the state
    /// flip and the side-effect outbox entry commit as one unit.
    pub async fn decide_oauth(
        &self,
        request_id: &Uuid,
        assertion: &OAuthAssertion,
    ) -> Result<TrustedRecord> {
        let mut store = self.store.write().await;
        let current = get_active(&store, request_id, "decide_oauth")?.clone();

        if current.state != RequestState::Created {
            return Err(VerificationError::InvalidState {
                operation: "decide_oauth".to_string(),
                state: current.state.to_string(),
            });
        }

        let subject = self.oauth_verifier.verify(assertion, Utc::now())?;
        ensure_no_conflict(&store, &current.identity, Some(&subject.student_number))?;

        let record = TrustedRecord::new(current.identity.clone(), VerificationMethod::Oauth)
            .with_student_number(subject.student_number.clone())
            .with_context(subject.claims.clone());

        let mut accepted = current.clone();
        accepted.state = RequestState::Accepted;
        accepted.decided_at = Some(Utc::now());

        let entry = OutboxEntry::accepted(
            accepted.id,
            accepted.identity.clone(),
            record.id,
            record.student_number.clone(),
            VerificationMethod::Oauth.describe(),
            Some(subject.email.clone()),
        );

        store
            .commit_acceptance(accepted, current.version, record.clone(), entry)
            .await?;

        info!(
            "Request {} accepted via OAuth (subject {}, student {})",
            request_id, subject.subject, subject.student_number
        );
        Ok(record)
    }

    /// Decide a request manually: only legal from `InReview`, and only for a
    /// reviewer registered for the request's guild.
    pub async fn decide_review(
        &self,
        request_id: &Uuid,
        reviewer_user_id: u64,
        outcome: ReviewOutcome,
    ) -> Result<()> {
        let mut store = self.store.write().await;
        let current = get_active(&store, request_id, "decide_review")?.clone();

        if current.state != RequestState::InReview {
            return Err(VerificationError::InvalidState {
                operation: "decide_review".to_string(),
                state: current.state.to_string(),
            });
        }

        let reviewer_id =
            ReviewVerifier::authorize(&store, current.identity.guild_id, reviewer_user_id)?;

        let contact_email = current
            .evidence
            .as_ref()
            .and_then(|e| e.contact_email.clone());

        match outcome {
            ReviewOutcome::Accept { student_number } => {
                let student_number = student_number.or_else(|| {
                    contact_email
                        .as_deref()
                        .and_then(crate::state::student_number_from_email)
                });
                ensure_no_conflict(&store, &current.identity, student_number.as_deref())?;

                let mut context = serde_json::Map::new();
                context.insert(
                    "reviewer_user_id".to_string(),
                    serde_json::json!(reviewer_user_id),
                );

                let mut record =
                    TrustedRecord::new(current.identity.clone(), VerificationMethod::Reviewed)
                        .with_context(context);
                if let Some(number) = student_number {
                    record = record.with_student_number(number);
                }

                let mut accepted = current.clone();
                accepted.state = RequestState::Accepted;
                accepted.reviewer = Some(reviewer_id);
                accepted.decided_at = Some(Utc::now());

                let entry = OutboxEntry::accepted(
                    accepted.id,
                    accepted.identity.clone(),
                    record.id,
                    record.student_number.clone(),
                    VerificationMethod::Reviewed.describe(),
                    contact_email,
                );

                store
                    .commit_acceptance(accepted, current.version, record, entry)
                    .await?;
                info!(
                    "Request {} accepted by reviewer {}",
                    request_id, reviewer_user_id
                );
            }
            ReviewOutcome::Reject { reason } => {
                let mut rejected = current.clone();
                rejected.state = RequestState::Rejected;
                rejected.reviewer = Some(reviewer_id);
                rejected.rejection_reason = Some(reason.clone());
                rejected.decided_at = Some(Utc::now());

                let entry = OutboxEntry::rejected(
                    rejected.id,
                    rejected.identity.clone(),
                    reason,
                    contact_email,
                );

                store
                    .update_request(rejected, current.version, Some(entry))
                    .await?;
                info!(
                    "Request {} rejected by reviewer {}",
                    request_id, reviewer_user_id
                );
            }
        }
        Ok(())
    }

    /// Create a trusted record without a request: staff assignment,
    /// enforcement, migration imports. The acceptance side effects still go
    /// through the outbox.
    pub async fn trust_directly(
        &self,
        identity: UserIdentity,
        method: VerificationMethod,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<TrustedRecord> {
        let mut store = self.store.write().await;

        ensure_no_conflict(&store, &identity, None)?;

        let record = TrustedRecord::new(identity.clone(), method).with_context(context);
        let entry = OutboxEntry::accepted(
            record.id,
            identity.clone(),
            record.id,
            None,
            method.describe(),
            None,
        );

        store.insert_trusted(record.clone(), Some(entry)).await?;
        info!(
            "Trusted record {} created directly for user {} ({})",
            record.id,
            identity.user_id,
            method.describe()
        );
        Ok(record)
    }

    /// Remove a member's trusted record. Request references are nullified,
    /// nothing else cascades.
    pub async fn revoke(&self, guild_id: u64, user_id: u64) -> Result<Option<TrustedRecord>> {
        let mut store = self.store.write().await;

        let record_id = store
            .trusted_for_identity(&UserIdentity::new(guild_id, user_id))
            .map(|r| r.id);
        let record_id = match record_id {
            Some(id) => id,
            None => return Ok(None),
        };

        let removed = store.delete_trusted(&record_id).await?;
        if removed.is_some() {
            info!(
                "Revoked trusted record {} for user {} in guild {}",
                record_id, user_id, guild_id
            );
        }
        Ok(removed)
    }

    /// Review queue for a guild: requests sitting in `InReview`, oldest
    /// first.
    pub async fn list_pending(&self, guild_id: u64) -> Vec<VerificationRequest> {
        let store = self.store.read().await;
        store.requests_in_state(guild_id, RequestState::InReview)
    }

    pub async fn status(&self, request_id: &Uuid) -> Result<RequestState> {
        let store = self.store.read().await;
        store
            .get_request(request_id)
            .map(|r| r.state)
            .ok_or_else(|| VerificationError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }

    pub async fn find_by_secret(&self, secret: &str) -> Option<VerificationRequest> {
        let store = self.store.read().await;
        store.find_request_by_secret(secret).cloned()
    }

    pub async fn is_trusted(&self, guild_id: u64, user_id: u64) -> bool {
        let store = self.store.read().await;
        store
            .trusted_for_identity(&UserIdentity::new(guild_id, user_id))
            .is_some()
    }

    pub async fn trusted_record(&self, guild_id: u64, user_id: u64) -> Option<TrustedRecord> {
        let store = self.store.read().await;
        store
            .trusted_for_identity(&UserIdentity::new(guild_id, user_id))
            .cloned()
    }
}

/// Fetch a request for a transition, mapping terminal states to
/// `AlreadyDecided` up front.
fn get_active<'a>(
    store: &'a crate::state::IdentityStore,
    request_id: &Uuid,
    operation: &str,
) -> Result<&'a VerificationRequest> {
    let request =
        store
            .get_request(request_id)
            .ok_or_else(|| VerificationError::RequestNotFound {
                request_id: request_id.to_string(),
            })?;

    if request.state.is_terminal() {
        debug!(
            "Rejected '{}' on decided request {} ({})",
            operation, request_id, request.state
        );
        return Err(VerificationError::AlreadyDecided {
            request_id: request_id.to_string(),
        });
    }
    Ok(request)
}

/// Shared verification manager type
pub type SharedVerificationManager = Arc<VerificationManager>;

pub fn create_shared_verification_manager(
    store: SharedIdentityStore,
    oauth_verifier: OAuthVerifier,
) -> SharedVerificationManager {
    Arc::new(VerificationManager::new(store, oauth_verifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{create_shared_identity_store, DocumentImage, IdentityStore, Reviewer};
    use chrono::Duration;

    fn manager() -> VerificationManager {
        let store = create_shared_identity_store(IdentityStore::ephemeral());
        VerificationManager::new(
            store,
            OAuthVerifier::new("https://accounts.example.com", "client-123"),
        )
    }

    fn identity() -> UserIdentity {
        UserIdentity::with_names(1, "Test Guild", 42, "alice")
    }

    fn assertion(email: &str, expires_in: Duration) -> OAuthAssertion {
        let mut map = serde_json::Map::new();
        map.insert("iss".into(), "https://accounts.example.com".into());
        map.insert("aud".into(), "client-123".into());
        map.insert("sub".into(), "abc123".into());
        map.insert("email".into(), email.into());
        map.insert(
            "exp".into(),
            serde_json::json!((Utc::now() + expires_in).timestamp()),
        );
        OAuthAssertion::new(map)
    }

    fn evidence() -> Evidence {
        Evidence {
            front: DocumentImage {
                content_type: "image/jpeg".to_string(),
                bytes: vec![1, 2, 3],
            },
            back: DocumentImage {
                content_type: "image/jpeg".to_string(),
                bytes: vec![4, 5, 6],
            },
            contact_email: Some("s54321@test".to_string()),
        }
    }

    async fn add_reviewer(manager: &VerificationManager, guild_id: u64, user_id: u64) {
        let mut store = manager.store().write().await;
        store
            .add_reviewer(Reviewer::new(UserIdentity::new(guild_id, user_id)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_twice_yields_duplicate_identity() {
        let manager = manager();

        let first = manager.create(identity()).await.unwrap();
        let err = manager.create(identity()).await.unwrap_err();

        assert!(matches!(err, VerificationError::DuplicateIdentity { .. }));
        assert_eq!(
            manager.status(&first.id).await.unwrap(),
            RequestState::Created
        );
    }

    #[tokio::test]
    async fn test_oauth_accept_scenario() {
        let manager = manager();
        let request = manager.create(identity()).await.unwrap();

        let record = manager
            .decide_oauth(&request.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(record.student_number.as_deref(), Some("s12345"));
        assert_eq!(
            manager.status(&request.id).await.unwrap(),
            RequestState::Accepted
        );

        // Exactly one trusted record, bound to the request's identity
        let store = manager.store().read().await;
        assert_eq!(store.trusted.len(), 1);
        let stored = store.get_trusted(&record.id).unwrap();
        assert!(stored.identity.same_member(&request.identity));
        assert_eq!(
            store.get_request(&request.id).unwrap().trust,
            Some(record.id)
        );
    }

    #[tokio::test]
    async fn test_decide_oauth_requires_created_state() {
        let manager = manager();
        let request = manager.create(identity()).await.unwrap();
        manager.request_evidence(&request.id).await.unwrap();

        let err = manager
            .decide_oauth(&request.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, VerificationError::InvalidState { .. }));
        assert_eq!(
            manager.status(&request.id).await.unwrap(),
            RequestState::AwaitingEvidence
        );
    }

    #[tokio::test]
    async fn test_expired_assertion_creates_nothing() {
        let manager = manager();
        let request = manager.create(identity()).await.unwrap();

        let err = manager
            .decide_oauth(&request.id, &assertion("s12345@test", Duration::minutes(-5)))
            .await
            .unwrap_err();

        assert!(matches!(err, VerificationError::InvalidAssertion { .. }));
        assert_eq!(
            manager.status(&request.id).await.unwrap(),
            RequestState::Created
        );
        let store = manager.store().read().await;
        assert!(store.trusted.is_empty());
        assert!(store.outbox_pending().is_empty());
    }

    #[tokio::test]
    async fn test_oauth_retry_after_rejection_succeeds() {
        let manager = manager();
        let request = manager.create(identity()).await.unwrap();

        let err = manager
            .decide_oauth(&request.id, &assertion("alice@test", Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        manager
            .decide_oauth(&request.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(
            manager.status(&request.id).await.unwrap(),
            RequestState::Accepted
        );
    }

    #[tokio::test]
    async fn test_oauth_conflict_with_bound_student_number() {
        let manager = manager();

        let first = manager.create(identity()).await.unwrap();
        manager
            .decide_oauth(&first.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap();

        let second = manager.create(UserIdentity::new(1, 43)).await.unwrap();
        let err = manager
            .decide_oauth(&second.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, VerificationError::IdentityConflict { .. }));
        assert_eq!(
            manager.status(&second.id).await.unwrap(),
            RequestState::Created
        );
    }

    #[tokio::test]
    async fn test_review_accept_flow() {
        let manager = manager();
        add_reviewer(&manager, 1, 7).await;

        let request = manager.create(identity()).await.unwrap();
        manager.request_evidence(&request.id).await.unwrap();
        manager
            .submit_evidence(&request.id, evidence())
            .await
            .unwrap();

        manager
            .decide_review(
                &request.id,
                7,
                ReviewOutcome::Accept {
                    student_number: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            manager.status(&request.id).await.unwrap(),
            RequestState::Accepted
        );
        let store = manager.store().read().await;
        let request = store.get_request(&request.id).unwrap();
        assert!(request.reviewer.is_some());
        // Student number derived from the evidence contact email
        let record = store.get_trusted(&request.trust.unwrap()).unwrap();
        assert_eq!(record.student_number.as_deref(), Some("s54321"));
        assert_eq!(record.method, VerificationMethod::Reviewed);
    }

    #[tokio::test]
    async fn test_unauthorized_reviewer_leaves_request_in_review() {
        let manager = manager();
        add_reviewer(&manager, 2, 7).await; // reviewer for another guild

        let request = manager.create(identity()).await.unwrap();
        manager
            .submit_evidence(&request.id, evidence())
            .await
            .unwrap();

        let err = manager
            .decide_review(
                &request.id,
                7,
                ReviewOutcome::Accept {
                    student_number: None,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, VerificationError::Unauthorized { .. }));
        assert_eq!(
            manager.status(&request.id).await.unwrap(),
            RequestState::InReview
        );
    }

    #[tokio::test]
    async fn test_review_reject_records_reason() {
        let manager = manager();
        add_reviewer(&manager, 1, 7).await;

        let request = manager.create(identity()).await.unwrap();
        manager
            .submit_evidence(&request.id, evidence())
            .await
            .unwrap();
        manager
            .decide_review(
                &request.id,
                7,
                ReviewOutcome::Reject {
                    reason: "photo illegible".to_string(),
                },
            )
            .await
            .unwrap();

        let store = manager.store().read().await;
        let stored = store.get_request(&request.id).unwrap();
        assert_eq!(stored.state, RequestState::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("photo illegible"));
        assert!(stored.trust.is_none());
    }

    #[tokio::test]
    async fn test_decided_request_refuses_everything() {
        let manager = manager();
        let request = manager.create(identity()).await.unwrap();
        manager
            .decide_oauth(&request.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap();

        let err = manager
            .decide_oauth(&request.id, &assertion("s12345@test", Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::AlreadyDecided { .. }));

        let err = manager
            .submit_evidence(&request.id, evidence())
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::AlreadyDecided { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_review_decisions_one_wins() {
        let manager = Arc::new(manager());
        add_reviewer(&manager, 1, 7).await;

        let request = manager.create(identity()).await.unwrap();
        manager
            .submit_evidence(&request.id, evidence())
            .await
            .unwrap();

        let a = {
            let manager = manager.clone();
            let id = request.id;
            tokio::spawn(async move {
                manager
                    .decide_review(
                        &id,
                        7,
                        ReviewOutcome::Accept {
                            student_number: Some("s11111".to_string()),
                        },
                    )
                    .await
            })
        };
        let b = {
            let manager = manager.clone();
            let id = request.id;
            tokio::spawn(async move {
                manager
                    .decide_review(
                        &id,
                        7,
                        ReviewOutcome::Reject {
                            reason: "duplicate".to_string(),
                        },
                    )
                    .await
            })
        };

        let results = vec![a.await.unwrap(), b.await.unwrap()];
        let oks = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(oks, 1);
        let err = results
            .into_iter()
            .find(|r| r.is_err())
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::AlreadyDecided { .. } | VerificationError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_trust_directly_and_revoke() {
        let manager = manager();

        manager
            .trust_directly(
                identity(),
                VerificationMethod::StaffAssigned,
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        assert!(manager.is_trusted(1, 42).await);

        // The member cannot open a request while trusted
        let err = manager.create(identity()).await.unwrap_err();
        assert!(matches!(err, VerificationError::DuplicateIdentity { .. }));

        let removed = manager.revoke(1, 42).await.unwrap();
        assert!(removed.is_some());
        assert!(!manager.is_trusted(1, 42).await);
        assert!(manager.revoke(1, 42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_pending_is_per_guild_and_ordered() {
        let manager = manager();

        let first = manager.create(identity()).await.unwrap();
        manager.submit_evidence(&first.id, evidence()).await.unwrap();

        let other_guild = manager.create(UserIdentity::new(2, 42)).await.unwrap();
        manager
            .submit_evidence(&other_guild.id, evidence())
            .await
            .unwrap();

        let pending = manager.list_pending(1).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }
}
