use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VerificationError};

use super::identity::UserIdentity;
use super::outbox::{ActionKind, ActionStatus, OutboxEntry};
use super::request::{RequestState, VerificationRequest};
use super::trusted::{Reviewer, TrustedRecord};

const SCHEMA_VERSION: u32 = 1;

/// Durable store for requests, trusted records, the reviewer roster and the
/// side-effect outbox.
///
/// Everything lives in one JSON file so a decision and its outbox entry are
/// committed in a single write. Mutating methods apply the change in memory,
/// persist, and roll the change back if the write fails, so a half-applied
/// decision is never visible.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityStore {
    /// Schema version for migrations
    pub version: u32,

    /// Last update timestamp
    pub last_updated: u64,

    pub requests: HashMap<Uuid, VerificationRequest>,

    pub trusted: HashMap<Uuid, TrustedRecord>,

    pub reviewers: HashMap<Uuid, Reviewer>,

    pub outbox: Vec<OutboxEntry>,

    /// Path of the backing file, set on load
    #[serde(skip)]
    path: String,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            last_updated: current_timestamp(),
            requests: HashMap::new(),
            trusted: HashMap::new(),
            reviewers: HashMap::new(),
            outbox: Vec::new(),
            path: String::new(),
        }
    }
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh store backed by `path`, for recovery from an unreadable file.
    pub fn empty(path: &str) -> Self {
        let mut store = Self::new();
        store.path = path.to_string();
        store
    }

    /// In-memory store for tests; persists to a scratch file nobody reads.
    #[cfg(test)]
    pub fn ephemeral() -> Self {
        let mut store = Self::new();
        store.path = std::env::temp_dir()
            .join(format!("warden-store-{}.json", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        store
    }

    /// Load from a JSON file, or create new if not exists.
    pub async fn load(path: &str) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let mut value: serde_json::Value = serde_json::from_str(&content)
                    .map_err(|e| VerificationError::ConfigParse {
                        path: path.to_string(),
                        source: e,
                    })?;

                let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
                if version == 0 {
                    // Pre-versioned file from early deployments
                    tracing::info!("Stamping identity store with schema version {}", SCHEMA_VERSION);
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert(
                            "version".to_string(),
                            serde_json::Value::Number(SCHEMA_VERSION.into()),
                        );
                    }
                }

                let mut store: IdentityStore = serde_json::from_value(value)
                    .map_err(|e| VerificationError::ConfigParse {
                        path: path.to_string(),
                        source: e,
                    })?;
                store.path = path.to_string();
                Ok(store)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut store = Self::new();
                store.path = path.to_string();
                Ok(store)
            }
            Err(e) => Err(VerificationError::StateLoad {
                path: path.to_string(),
                source: e,
            }),
        }
    }

    /// Save to the backing file atomically (temp file + rename).
    pub async fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = format!("{}.tmp", self.path);
        tokio::fs::write(&temp_path, &content)
            .await
            .map_err(|e| VerificationError::StateSave {
                path: self.path.clone(),
                source: e,
            })?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| VerificationError::StateSave {
                path: self.path.clone(),
                source: e,
            })?;

        Ok(())
    }

    // --- queries ---

    pub fn get_request(&self, id: &Uuid) -> Option<&VerificationRequest> {
        self.requests.get(id)
    }

    pub fn find_request_by_secret(&self, secret: &str) -> Option<&VerificationRequest> {
        self.requests.values().find(|r| r.secret_code == secret)
    }

    /// The one non-terminal request for this member, if any.
    pub fn active_request_for(&self, identity: &UserIdentity) -> Option<&VerificationRequest> {
        self.requests
            .values()
            .find(|r| r.is_active() && r.identity.same_member(identity))
    }

    pub fn requests_in_state(&self, guild_id: u64, state: RequestState) -> Vec<VerificationRequest> {
        let mut pending: Vec<VerificationRequest> = self
            .requests
            .values()
            .filter(|r| r.identity.guild_id == guild_id && r.state == state)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn get_trusted(&self, id: &Uuid) -> Option<&TrustedRecord> {
        self.trusted.get(id)
    }

    pub fn trusted_for_identity(&self, identity: &UserIdentity) -> Option<&TrustedRecord> {
        self.trusted
            .values()
            .find(|t| t.identity.same_member(identity))
    }

    pub fn trusted_by_student_number(&self, student_number: &str) -> Option<&TrustedRecord> {
        self.trusted
            .values()
            .find(|t| t.student_number.as_deref() == Some(student_number))
    }

    pub fn reviewers_for_guild(&self, guild_id: u64) -> Vec<&Reviewer> {
        self.reviewers
            .values()
            .filter(|r| r.identity.guild_id == guild_id)
            .collect()
    }

    pub fn is_reviewer(&self, guild_id: u64, user_id: u64) -> bool {
        self.reviewers
            .values()
            .any(|r| r.identity.guild_id == guild_id && r.identity.user_id == user_id)
    }

    pub fn reviewer_by_user(&self, guild_id: u64, user_id: u64) -> Option<&Reviewer> {
        self.reviewers
            .values()
            .find(|r| r.identity.guild_id == guild_id && r.identity.user_id == user_id)
    }

    // --- mutations ---

    /// Insert a new request. Storage-level guard for the one-active-request
    /// and no-existing-trust invariants.
    pub async fn insert_request(&mut self, request: VerificationRequest) -> Result<()> {
        if self.trusted_for_identity(&request.identity).is_some()
            || self.active_request_for(&request.identity).is_some()
        {
            return Err(VerificationError::DuplicateIdentity {
                guild_id: request.identity.guild_id,
                user_id: request.identity.user_id,
            });
        }

        let id = request.id;
        self.requests.insert(id, request);
        self.touch();

        if let Err(e) = self.save().await {
            self.requests.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Replace a request under optimistic concurrency. `expected_version`
    /// is the version the caller read; a mismatch means someone else
    /// committed first. Optionally appends an outbox entry in the same
    /// write.
    pub async fn update_request(
        &mut self,
        mut updated: VerificationRequest,
        expected_version: u64,
        outbox: Option<OutboxEntry>,
    ) -> Result<()> {
        let current = self.requests.get(&updated.id).ok_or_else(|| {
            VerificationError::RequestNotFound {
                request_id: updated.id.to_string(),
            }
        })?;

        if current.version != expected_version {
            return Err(VerificationError::Conflict {
                request_id: updated.id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        updated.version = expected_version + 1;
        let previous = self.requests.insert(updated.id, updated.clone());
        let outbox_added = self.push_outbox(outbox);
        self.touch();

        if let Err(e) = self.save().await {
            if outbox_added {
                self.outbox.pop();
            }
            match previous {
                Some(prev) => {
                    self.requests.insert(updated.id, prev);
                }
                None => {
                    self.requests.remove(&updated.id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Commit an acceptance: mark the request accepted, create the trusted
    /// record and append the outbox entry as one unit. If the write fails
    /// none of the three is visible.
    pub async fn commit_acceptance(
        &mut self,
        mut accepted: VerificationRequest,
        expected_version: u64,
        record: TrustedRecord,
        outbox: OutboxEntry,
    ) -> Result<()> {
        let current = self.requests.get(&accepted.id).ok_or_else(|| {
            VerificationError::RequestNotFound {
                request_id: accepted.id.to_string(),
            }
        })?;

        if current.version != expected_version {
            return Err(VerificationError::Conflict {
                request_id: accepted.id.to_string(),
                expected: expected_version,
                found: current.version,
            });
        }

        self.check_trust_uniqueness(&record)?;

        accepted.version = expected_version + 1;
        accepted.trust = Some(record.id);

        let record_id = record.id;
        let previous = self.requests.insert(accepted.id, accepted.clone());
        self.trusted.insert(record_id, record);
        self.outbox.push(outbox);
        self.touch();

        if let Err(e) = self.save().await {
            self.outbox.pop();
            self.trusted.remove(&record_id);
            match previous {
                Some(prev) => {
                    self.requests.insert(accepted.id, prev);
                }
                None => {
                    self.requests.remove(&accepted.id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Insert a trusted record with no originating request (staff assigned,
    /// enforced, migrated, context provided).
    pub async fn insert_trusted(
        &mut self,
        record: TrustedRecord,
        outbox: Option<OutboxEntry>,
    ) -> Result<()> {
        self.check_trust_uniqueness(&record)?;

        let id = record.id;
        self.trusted.insert(id, record);
        let outbox_added = self.push_outbox(outbox);
        self.touch();

        if let Err(e) = self.save().await {
            if outbox_added {
                self.outbox.pop();
            }
            self.trusted.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    /// Delete a trusted record and nullify every request reference to it.
    /// No implicit cascade beyond that.
    pub async fn delete_trusted(&mut self, id: &Uuid) -> Result<Option<TrustedRecord>> {
        let removed = match self.trusted.remove(id) {
            Some(record) => record,
            None => return Ok(None),
        };

        let nullified: Vec<Uuid> = self
            .requests
            .values()
            .filter(|r| r.trust == Some(*id))
            .map(|r| r.id)
            .collect();
        for request_id in &nullified {
            if let Some(request) = self.requests.get_mut(request_id) {
                request.trust = None;
            }
        }
        self.touch();

        if let Err(e) = self.save().await {
            for request_id in &nullified {
                if let Some(request) = self.requests.get_mut(request_id) {
                    request.trust = Some(*id);
                }
            }
            self.trusted.insert(*id, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    pub async fn add_reviewer(&mut self, reviewer: Reviewer) -> Result<()> {
        if self.is_reviewer(reviewer.identity.guild_id, reviewer.identity.user_id) {
            return Ok(());
        }
        let id = reviewer.id;
        self.reviewers.insert(id, reviewer);
        self.touch();

        if let Err(e) = self.save().await {
            self.reviewers.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove_reviewer(&mut self, guild_id: u64, user_id: u64) -> Result<bool> {
        let found = self
            .reviewers
            .values()
            .find(|r| r.identity.guild_id == guild_id && r.identity.user_id == user_id)
            .map(|r| r.id);

        let id = match found {
            Some(id) => id,
            None => return Ok(false),
        };
        let removed = self.reviewers.remove(&id);
        self.touch();

        if let Err(e) = self.save().await {
            if let Some(reviewer) = removed {
                self.reviewers.insert(id, reviewer);
            }
            return Err(e);
        }
        Ok(true)
    }

    // --- outbox ---

    /// Entries with at least one action still owed, oldest first.
    pub fn outbox_pending(&self) -> Vec<OutboxEntry> {
        self.outbox
            .iter()
            .filter(|e| !e.is_complete())
            .cloned()
            .collect()
    }

    /// Record the outcome of one delivery attempt.
    pub async fn record_action_result(
        &mut self,
        entry_id: &Uuid,
        action: ActionKind,
        outcome: std::result::Result<(), String>,
    ) -> Result<()> {
        let entry = self
            .outbox
            .iter_mut()
            .find(|e| e.id == *entry_id)
            .ok_or_else(|| VerificationError::Internal {
                message: format!("outbox entry {} vanished", entry_id),
            })?;

        if let Some(record) = entry.actions.iter_mut().find(|a| a.action == action) {
            record.attempts += 1;
            match outcome {
                Ok(()) => {
                    record.status = ActionStatus::Done;
                    record.last_error = None;
                }
                Err(message) => {
                    record.status = ActionStatus::Failed;
                    record.last_error = Some(message);
                }
            }
        }
        if entry.is_complete() {
            entry.completed_at = Some(chrono::Utc::now());
        }
        self.touch();
        self.save().await
    }

    // --- internals ---

    fn check_trust_uniqueness(&self, record: &TrustedRecord) -> Result<()> {
        if self.trusted_for_identity(&record.identity).is_some() {
            return Err(VerificationError::IdentityConflict {
                detail: format!(
                    "user {} in guild {} already has a trusted record",
                    record.identity.user_id, record.identity.guild_id
                ),
            });
        }
        if let Some(number) = record.student_number.as_deref() {
            if self.trusted_by_student_number(number).is_some() {
                return Err(VerificationError::IdentityConflict {
                    detail: format!("student number {} is already bound", number),
                });
            }
        }
        Ok(())
    }

    fn push_outbox(&mut self, entry: Option<OutboxEntry>) -> bool {
        match entry {
            Some(entry) => {
                self.outbox.push(entry);
                true
            }
            None => false,
        }
    }

    fn touch(&mut self) {
        self.last_updated = current_timestamp();
    }
}

/// Shared identity store type
pub type SharedIdentityStore = Arc<tokio::sync::RwLock<IdentityStore>>;

pub fn create_shared_identity_store(store: IdentityStore) -> SharedIdentityStore {
    Arc::new(tokio::sync::RwLock::new(store))
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::super::identity::VerificationMethod;
    use super::*;

    fn identity() -> UserIdentity {
        UserIdentity::with_names(1, "Test Guild", 42, "alice")
    }

    #[tokio::test]
    async fn test_insert_request_rejects_duplicate_identity() {
        let mut store = IdentityStore::ephemeral();

        store
            .insert_request(VerificationRequest::new(identity()))
            .await
            .unwrap();

        let err = store
            .insert_request(VerificationRequest::new(identity()))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::DuplicateIdentity { .. }));

        // A different member is fine
        store
            .insert_request(VerificationRequest::new(UserIdentity::new(1, 43)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_request_rejects_already_trusted() {
        let mut store = IdentityStore::ephemeral();
        store
            .insert_trusted(
                TrustedRecord::new(identity(), VerificationMethod::Migrated),
                None,
            )
            .await
            .unwrap();

        let err = store
            .insert_request(VerificationRequest::new(identity()))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::DuplicateIdentity { .. }));
    }

    #[tokio::test]
    async fn test_update_request_version_conflict() {
        let mut store = IdentityStore::ephemeral();
        let request = VerificationRequest::new(identity());
        let id = request.id;
        store.insert_request(request).await.unwrap();

        let mut first = store.get_request(&id).unwrap().clone();
        first.state = RequestState::AwaitingEvidence;
        store.update_request(first, 0, None).await.unwrap();
        assert_eq!(store.get_request(&id).unwrap().version, 1);

        // A second writer that read version 0 must lose
        let mut stale = store.get_request(&id).unwrap().clone();
        stale.state = RequestState::InReview;
        let err = store.update_request(stale, 0, None).await.unwrap_err();
        assert!(matches!(err, VerificationError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_commit_acceptance_is_atomic_pair() {
        let mut store = IdentityStore::ephemeral();
        let request = VerificationRequest::new(identity());
        let id = request.id;
        store.insert_request(request).await.unwrap();

        let mut accepted = store.get_request(&id).unwrap().clone();
        accepted.state = RequestState::Accepted;
        accepted.decided_at = Some(chrono::Utc::now());

        let record = TrustedRecord::new(identity(), VerificationMethod::Oauth)
            .with_student_number("s12345");
        let record_id = record.id;
        let entry = OutboxEntry::accepted(
            id,
            identity(),
            record_id,
            Some("s12345".to_string()),
            "oauth",
            None,
        );

        store.commit_acceptance(accepted, 0, record, entry).await.unwrap();

        let stored = store.get_request(&id).unwrap();
        assert_eq!(stored.state, RequestState::Accepted);
        assert_eq!(stored.trust, Some(record_id));
        assert!(store.get_trusted(&record_id).is_some());
        assert_eq!(store.outbox_pending().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_acceptance_rejects_bound_student_number() {
        let mut store = IdentityStore::ephemeral();
        store
            .insert_trusted(
                TrustedRecord::new(UserIdentity::new(1, 99), VerificationMethod::Oauth)
                    .with_student_number("s12345"),
                None,
            )
            .await
            .unwrap();

        let request = VerificationRequest::new(identity());
        let id = request.id;
        store.insert_request(request).await.unwrap();

        let mut accepted = store.get_request(&id).unwrap().clone();
        accepted.state = RequestState::Accepted;
        let record = TrustedRecord::new(identity(), VerificationMethod::Oauth)
            .with_student_number("s12345");
        let entry = OutboxEntry::accepted(id, identity(), record.id, None, "oauth", None);

        let err = store
            .commit_acceptance(accepted, 0, record, entry)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::IdentityConflict { .. }));

        // Nothing was applied
        assert_eq!(store.get_request(&id).unwrap().state, RequestState::Created);
        assert!(store.trusted_for_identity(&identity()).is_none());
        assert!(store.outbox_pending().is_empty());
    }

    #[tokio::test]
    async fn test_delete_trusted_nullifies_request_reference() {
        let mut store = IdentityStore::ephemeral();
        let request = VerificationRequest::new(identity());
        let id = request.id;
        store.insert_request(request).await.unwrap();

        let mut accepted = store.get_request(&id).unwrap().clone();
        accepted.state = RequestState::Accepted;
        let record = TrustedRecord::new(identity(), VerificationMethod::Oauth);
        let record_id = record.id;
        let entry = OutboxEntry::accepted(id, identity(), record_id, None, "oauth", None);
        store.commit_acceptance(accepted, 0, record, entry).await.unwrap();

        store.delete_trusted(&record_id).await.unwrap();

        assert!(store.get_trusted(&record_id).is_none());
        assert_eq!(store.get_request(&id).unwrap().trust, None);
    }

    #[tokio::test]
    async fn test_reviewer_roster() {
        let mut store = IdentityStore::ephemeral();
        store
            .add_reviewer(Reviewer::new(UserIdentity::new(1, 7)))
            .await
            .unwrap();

        assert!(store.is_reviewer(1, 7));
        assert!(!store.is_reviewer(2, 7));
        assert_eq!(store.reviewers_for_guild(1).len(), 1);

        assert!(store.remove_reviewer(1, 7).await.unwrap());
        assert!(!store.is_reviewer(1, 7));
        assert!(!store.remove_reviewer(1, 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_action_result_marks_entry_complete() {
        let mut store = IdentityStore::ephemeral();
        let request = VerificationRequest::new(identity());
        let id = request.id;
        store.insert_request(request).await.unwrap();

        let entry = OutboxEntry::evidence_submitted(id, identity());
        let entry_id = entry.id;
        let mut current = store.get_request(&id).unwrap().clone();
        current.state = RequestState::InReview;
        store.update_request(current, 0, Some(entry)).await.unwrap();

        store
            .record_action_result(&entry_id, ActionKind::ReviewerAlert, Ok(()))
            .await
            .unwrap();

        assert!(store.outbox_pending().is_empty());
        let stored = store.outbox.iter().find(|e| e.id == entry_id).unwrap();
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.actions[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_store_roundtrips_through_file() {
        let path = std::env::temp_dir()
            .join(format!("warden-roundtrip-{}.json", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();

        let mut store = IdentityStore::load(&path).await.unwrap();
        store
            .insert_request(VerificationRequest::new(identity()))
            .await
            .unwrap();

        let reloaded = IdentityStore::load(&path).await.unwrap();
        assert_eq!(reloaded.requests.len(), 1);
        assert_eq!(reloaded.version, 1);

        tokio::fs::remove_file(&path).await.ok();
    }
}
