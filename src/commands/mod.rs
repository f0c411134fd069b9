pub mod general;
pub mod staff;
pub mod verification;

pub use general::{help, ping};
pub use staff::{request_evidence, reviewer, trust};
pub use verification::{manage, verify};
