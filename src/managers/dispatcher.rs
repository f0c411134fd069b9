use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::GuildDirectory;
use crate::error::{Result, VerificationError};
use crate::messages::{self, DmMessage};
use crate::state::{ActionKind, OutboxDecision, OutboxEntry, SharedIdentityStore};

/// Which mail template to send. The implementation maps these to provider
/// template ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    Confirmation,
    Rejection,
}

/// External collaborators the dispatcher talks to. Every method must be
/// idempotent or safely retryable: the worker re-invokes failed actions on
/// the next pass.
#[async_trait]
pub trait SideEffects: Send + Sync {
    async fn grant_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> Result<()>;

    async fn direct_message(&self, user_id: u64, message: DmMessage) -> Result<()>;

    async fn send_templated_email(
        &self,
        to: &str,
        kind: EmailKind,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;
}

/// Drains the outbox and executes side effects.
///
/// Per-action completion in the store is the idempotence guard: an action
/// marked done is never run again, a failed one stays eligible for the next
/// pass. Failures are recorded on the action and surfaced to the operator
/// log; they never touch request state. Every external call is bounded by a
/// timeout, after which the action counts as failed and is retried later.
pub struct Dispatcher {
    store: SharedIdentityStore,
    guilds: GuildDirectory,
    effects: Arc<dyn SideEffects>,
    /// Public base URL for verification links embedded in DMs
    base_url: String,
    action_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: SharedIdentityStore,
        guilds: GuildDirectory,
        effects: Arc<dyn SideEffects>,
        base_url: String,
    ) -> Self {
        Self {
            store,
            guilds,
            effects,
            base_url,
            action_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// One delivery pass over every entry with pending actions. Returns the
    /// number of actions that completed this pass.
    pub async fn drain(&self) -> usize {
        let pending = {
            let store = self.store.read().await;
            store.outbox_pending()
        };

        if pending.is_empty() {
            return 0;
        }
        debug!("Dispatching {} outbox entries", pending.len());

        let mut delivered = 0;
        for entry in pending {
            delivered += self.deliver_entry(&entry).await;
        }
        delivered
    }

    async fn deliver_entry(&self, entry: &OutboxEntry) -> usize {
        let mut delivered = 0;

        for action in entry.actions.iter().filter(|a| a.needs_delivery()) {
            let outcome = match tokio::time::timeout(
                self.action_timeout,
                self.perform(entry, action.action),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "timed out after {}s",
                    self.action_timeout.as_secs()
                )),
            };

            match &outcome {
                Ok(()) => {
                    delivered += 1;
                    info!(
                        "Delivered {} for request {}",
                        action.action.name(),
                        entry.request_id
                    );
                }
                Err(message) => {
                    // Operator-visible; the stored decision is untouched
                    error!(
                        "{}",
                        VerificationError::ExternalActionFailed {
                            request_id: entry.request_id.to_string(),
                            action: action.action.name().to_string(),
                            message: message.clone(),
                        }
                    );
                }
            }

            let mut store = self.store.write().await;
            if let Err(e) = store
                .record_action_result(&entry.id, action.action, outcome)
                .await
            {
                error!(
                    "Failed to record action result for entry {}: {}",
                    entry.id, e
                );
            }
        }
        delivered
    }

    async fn perform(&self, entry: &OutboxEntry, action: ActionKind) -> Result<()> {
        match (action, &entry.decision) {
            (ActionKind::GrantRole, OutboxDecision::Accepted { .. }) => {
                // Fresh snapshot so a rotated trusted role id is picked up
                let config = self.guilds.snapshot(entry.identity.guild_id).await?;
                self.effects
                    .grant_role(
                        entry.identity.guild_id,
                        entry.identity.user_id,
                        config.trusted_role_id,
                    )
                    .await
            }
            (
                ActionKind::ConfirmationDm,
                OutboxDecision::Accepted {
                    student_number,
                    method,
                    ..
                },
            ) => {
                let message = messages::confirmation_message(
                    &entry.created_at.to_rfc3339(),
                    student_number.as_deref(),
                    method,
                );
                self.effects
                    .direct_message(entry.identity.user_id, message)
                    .await
            }
            (
                ActionKind::ConfirmationEmail,
                OutboxDecision::Accepted {
                    student_number,
                    email,
                    ..
                },
            ) => {
                let to = match email {
                    Some(to) => to,
                    // No address on record; nothing owed
                    None => return Ok(()),
                };
                let mut data = serde_json::Map::new();
                data.insert(
                    "who".to_string(),
                    serde_json::json!(entry.identity.display_name()),
                );
                data.insert(
                    "student_num".to_string(),
                    serde_json::json!(student_number.clone().unwrap_or_default()),
                );
                data.insert(
                    "guild".to_string(),
                    serde_json::json!(entry.identity.guild_name.clone().unwrap_or_default()),
                );
                data.insert(
                    "discord".to_string(),
                    serde_json::json!(entry.identity.user_name.clone().unwrap_or_default()),
                );
                self.effects
                    .send_templated_email(to, EmailKind::Confirmation, data)
                    .await
            }
            (ActionKind::RejectionEmail, OutboxDecision::Rejected { reason, email }) => {
                let to = match email {
                    Some(to) => to,
                    None => return Ok(()),
                };
                let mut data = serde_json::Map::new();
                data.insert(
                    "guild".to_string(),
                    serde_json::json!(entry.identity.guild_name.clone().unwrap_or_default()),
                );
                data.insert("reason".to_string(), serde_json::json!(reason));
                self.effects
                    .send_templated_email(to, EmailKind::Rejection, data)
                    .await
            }
            (ActionKind::RejectionDm, OutboxDecision::Rejected { reason, .. }) => {
                self.effects
                    .direct_message(entry.identity.user_id, messages::rejection_message(reason))
                    .await
            }
            (
                ActionKind::EvidenceRequestDm,
                OutboxDecision::EvidenceRequested { secret_code },
            ) => {
                let url = format!("{}/verify/{}", self.base_url, secret_code);
                self.effects
                    .direct_message(
                        entry.identity.user_id,
                        messages::evidence_request_message(&url),
                    )
                    .await
            }
            (ActionKind::ReviewerAlert, OutboxDecision::EvidenceSubmitted) => {
                let reviewers: Vec<u64> = {
                    let store = self.store.read().await;
                    store
                        .reviewers_for_guild(entry.identity.guild_id)
                        .iter()
                        .map(|r| r.identity.user_id)
                        .collect()
                };
                if reviewers.is_empty() {
                    return Err(VerificationError::Internal {
                        message: format!(
                            "no reviewers registered for guild {}",
                            entry.identity.guild_id
                        ),
                    });
                }

                let review_url = format!("{}/admin", self.base_url);
                let message = messages::reviewer_alert_message(
                    &entry.identity.display_name(),
                    &review_url,
                );

                let sends = reviewers
                    .iter()
                    .map(|user_id| self.effects.direct_message(*user_id, message.clone()));
                let failures: Vec<String> = futures::future::join_all(sends)
                    .await
                    .into_iter()
                    .filter_map(|r| r.err().map(|e| e.to_string()))
                    .collect();

                if failures.is_empty() {
                    Ok(())
                } else {
                    Err(VerificationError::Internal {
                        message: format!(
                            "{} of {} reviewer alerts failed: {}",
                            failures.len(),
                            reviewers.len(),
                            failures.join("; ")
                        ),
                    })
                }
            }
            (action, _) => Err(VerificationError::Internal {
                message: format!(
                    "action {} does not belong to a {} decision",
                    action.name(),
                    entry.decision_kind()
                ),
            }),
        }
    }
}

/// Shared dispatcher type
pub type SharedDispatcher = Arc<Dispatcher>;

pub fn create_shared_dispatcher(
    store: SharedIdentityStore,
    guilds: GuildDirectory,
    effects: Arc<dyn SideEffects>,
    base_url: String,
) -> SharedDispatcher {
    Arc::new(Dispatcher::new(store, guilds, effects, base_url))
}

/// Background worker polling the outbox until shutdown.
pub fn spawn_dispatcher_worker(
    dispatcher: SharedDispatcher,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Outbox worker started (poll interval {}s)",
            poll_interval.as_secs()
        );
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let delivered = dispatcher.drain().await;
            if delivered > 0 {
                debug!("Outbox worker delivered {} actions", delivered);
            }
        }
    })
}
