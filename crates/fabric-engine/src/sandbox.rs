//! The sandboxed code-execution runtime is explicitly out of scope (§1);
//! this trait is the opaque `(task, log) -> (branch_name, result) | error`
//! contract §9's design notes call for, so the rest of the engine has
//! something concrete to drive.

use async_trait::async_trait;
use fabric_collab::WorkItem;

#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub branch_name: String,
    pub results: serde_json::Value,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<SandboxOutcome, String>;
}

/// Deterministic sandbox used by engine tests.
pub struct MockSandboxRuntime {
    pub succeed: bool,
}

impl MockSandboxRuntime {
    pub fn always_succeeds() -> Self {
        Self { succeed: true }
    }

    pub fn always_fails() -> Self {
        Self { succeed: false }
    }
}

#[async_trait]
impl SandboxRuntime for MockSandboxRuntime {
    async fn execute(&self, item: &WorkItem) -> Result<SandboxOutcome, String> {
        if self.succeed {
            Ok(SandboxOutcome {
                branch_name: format!("fabric/{}", item.item_id),
                results: serde_json::json!({"item_id": item.item_id}),
            })
        } else {
            Err("sandbox unavailable".to_string())
        }
    }
}
