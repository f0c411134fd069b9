pub mod audit;
pub mod identity;
pub mod outbox;
pub mod request;
pub mod store;
pub mod trusted;

pub use audit::{create_shared_audit_log, AuditLog, SharedAuditLog};
pub use identity::{
    student_number_from_email, DocumentImage, Evidence, UserIdentity, VerificationMethod,
};
pub use outbox::{ActionKind, ActionStatus, OutboxDecision, OutboxEntry};
pub use request::{RequestState, VerificationRequest};
pub use store::{create_shared_identity_store, IdentityStore, SharedIdentityStore};
pub use trusted::{Reviewer, TrustedRecord};
