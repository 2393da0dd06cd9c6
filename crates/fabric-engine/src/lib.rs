//! Capability/availability broadcast, the work-claim engine, meta-discussion,
//! and cross-item dependency coordination (components C6-C9).
//!
//! Built on top of [`fabric_p2p::MessagingFabric`] and [`fabric_log::VerifiableLog`]
//! from the transport/log layer, and [`fabric_collab`]'s external-collaborator
//! traits (tracker, reasoning backend, escalation webhook).

pub mod agent;
pub mod capability;
pub mod conversation;
pub mod dependency;
pub mod error;
pub mod sandbox;
pub mod source;
pub mod types;
pub mod util;
pub mod worker;

pub use agent::{join_static_topics, Agent, AgentSettings};
pub use capability::{default_memo_path, CapabilityBroadcaster};
pub use conversation::MetaDiscussionEngine;
pub use dependency::DependencyCoordinator;
pub use error::EngineError;
pub use sandbox::{MockSandboxRuntime, SandboxOutcome, SandboxRuntime};
pub use source::{can_handle_task_type, ClaimEngine};
pub use types::*;
pub use worker::{run_item_worker, ItemWorkerContext};
