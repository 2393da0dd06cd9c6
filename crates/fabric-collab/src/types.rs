use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A repository the tracker currently considers active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub project_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Open,
    Claimed,
    Closed,
}

/// A unit of work sourced from the external tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub item_id: String,
    pub project_id: String,
    pub title: String,
    pub body: String,
    pub state: WorkItemState,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    pub task_type: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// Exclusive assignment of a work item to one agent, granted by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub project_id: String,
    pub item_id: String,
    pub claimant_node_id: String,
    pub claimed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Ok,
    Conflict,
}

/// Status reported back to the tracker as a work item progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ItemStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
}

impl Default for ItemStatus {
    fn default() -> Self {
        ItemStatus::InProgress
    }
}
