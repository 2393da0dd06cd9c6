pub mod error;
pub mod escalation;
pub mod reasoning;
pub mod tracker;
pub mod types;

pub use error::CollabError;
pub use escalation::{EscalationPayload, EscalationWebhook};
pub use reasoning::{HttpReasoningBackend, MockReasoningBackend, ReasoningBackend};
pub use tracker::{HttpTrackerClient, MockTrackerClient, TrackerClient};
pub use types::{Claim, ClaimOutcome, ItemStatus, Repository, StatusUpdate, WorkItem, WorkItemState};
