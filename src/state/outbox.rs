use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::UserIdentity;

/// One deliverable side effect of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GrantRole,
    ConfirmationDm,
    ConfirmationEmail,
    RejectionEmail,
    RejectionDm,
    EvidenceRequestDm,
    ReviewerAlert,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::GrantRole => "grant_role",
            ActionKind::ConfirmationDm => "confirmation_dm",
            ActionKind::ConfirmationEmail => "confirmation_email",
            ActionKind::RejectionEmail => "rejection_email",
            ActionKind::RejectionDm => "rejection_dm",
            ActionKind::EvidenceRequestDm => "evidence_request_dm",
            ActionKind::ReviewerAlert => "reviewer_alert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Done,
    Failed,
}

/// Per-action delivery bookkeeping. `Done` is never retried; `Failed`
/// actions stay eligible for the next worker pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: ActionKind,
    pub status: ActionStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ActionRecord {
    fn new(action: ActionKind) -> Self {
        Self {
            action,
            status: ActionStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn needs_delivery(&self) -> bool {
        self.status != ActionStatus::Done
    }
}

/// What was decided, with everything the dispatcher needs to deliver the
/// side effects without re-reading the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxDecision {
    Accepted {
        trust_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        student_number: Option<String>,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    Rejected {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    EvidenceRequested {
        secret_code: String,
    },
    EvidenceSubmitted,
}

/// Persisted record of side effects owed for one decision.
///
/// Written in the same store commit as the decision itself, then drained by
/// the dispatcher worker. A request gets at most one entry per decision
/// kind because terminal transitions happen at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub request_id: Uuid,
    pub identity: UserIdentity,
    pub decision: OutboxDecision,
    pub actions: Vec<ActionRecord>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    fn new(request_id: Uuid, identity: UserIdentity, decision: OutboxDecision) -> Self {
        let actions = match &decision {
            OutboxDecision::Accepted { .. } => vec![
                ActionRecord::new(ActionKind::GrantRole),
                ActionRecord::new(ActionKind::ConfirmationDm),
                ActionRecord::new(ActionKind::ConfirmationEmail),
            ],
            OutboxDecision::Rejected { .. } => vec![
                ActionRecord::new(ActionKind::RejectionEmail),
                ActionRecord::new(ActionKind::RejectionDm),
            ],
            OutboxDecision::EvidenceRequested { .. } => {
                vec![ActionRecord::new(ActionKind::EvidenceRequestDm)]
            }
            OutboxDecision::EvidenceSubmitted => {
                vec![ActionRecord::new(ActionKind::ReviewerAlert)]
            }
        };

        Self {
            id: Uuid::new_v4(),
            request_id,
            identity,
            decision,
            actions,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn accepted(
        request_id: Uuid,
        identity: UserIdentity,
        trust_id: Uuid,
        student_number: Option<String>,
        method: &str,
        email: Option<String>,
    ) -> Self {
        Self::new(
            request_id,
            identity,
            OutboxDecision::Accepted {
                trust_id,
                student_number,
                method: method.to_string(),
                email,
            },
        )
    }

    pub fn rejected(
        request_id: Uuid,
        identity: UserIdentity,
        reason: String,
        email: Option<String>,
    ) -> Self {
        Self::new(
            request_id,
            identity,
            OutboxDecision::Rejected { reason, email },
        )
    }

    pub fn evidence_requested(request_id: Uuid, identity: UserIdentity, secret_code: String) -> Self {
        Self::new(
            request_id,
            identity,
            OutboxDecision::EvidenceRequested { secret_code },
        )
    }

    pub fn evidence_submitted(request_id: Uuid, identity: UserIdentity) -> Self {
        Self::new(request_id, identity, OutboxDecision::EvidenceSubmitted)
    }

    pub fn is_complete(&self) -> bool {
        self.actions.iter().all(|a| a.status == ActionStatus::Done)
    }

    pub fn decision_kind(&self) -> &'static str {
        match self.decision {
            OutboxDecision::Accepted { .. } => "accepted",
            OutboxDecision::Rejected { .. } => "rejected",
            OutboxDecision::EvidenceRequested { .. } => "evidence_requested",
            OutboxDecision::EvidenceSubmitted => "evidence_submitted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_entry_actions_in_order() {
        let entry = OutboxEntry::accepted(
            Uuid::new_v4(),
            UserIdentity::new(1, 42),
            Uuid::new_v4(),
            Some("s12345".to_string()),
            "oauth",
            Some("s12345@test".to_string()),
        );

        let kinds: Vec<ActionKind> = entry.actions.iter().map(|a| a.action).collect();
        assert_eq!(
            kinds,
            vec![
                ActionKind::GrantRole,
                ActionKind::ConfirmationDm,
                ActionKind::ConfirmationEmail
            ]
        );
        assert!(!entry.is_complete());
    }

    #[test]
    fn test_entry_complete_when_all_done() {
        let mut entry = OutboxEntry::rejected(
            Uuid::new_v4(),
            UserIdentity::new(1, 42),
            "illegible photo".to_string(),
            None,
        );

        for action in &mut entry.actions {
            action.status = ActionStatus::Done;
        }
        assert!(entry.is_complete());
    }

    #[test]
    fn test_failed_action_still_needs_delivery() {
        let mut record = ActionRecord::new(ActionKind::GrantRole);
        record.status = ActionStatus::Failed;
        record.attempts = 2;
        assert!(record.needs_delivery());

        record.status = ActionStatus::Done;
        assert!(!record.needs_delivery());
    }
}
