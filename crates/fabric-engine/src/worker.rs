//! Per-item worker state machine (§4.7):
//! `discovered -> claim_attempt -> claimed -> planning -> executing ->
//! (completing | help_requested | escalated) -> (pr_created | abandoned)`.

use std::sync::{atomic::AtomicUsize, atomic::Ordering, Arc};

use fabric_collab::{ClaimOutcome, ItemStatus, StatusUpdate, TrackerClient, WorkItem};
use fabric_log::{EventType, VerifiableLog};
use fabric_p2p::{item_topic, EnvelopePayload, MessageType, MessagingFabric};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    conversation::MetaDiscussionEngine,
    dependency::DependencyCoordinator,
    error::EngineError,
    sandbox::SandboxRuntime,
    types::WorkerState,
    util::to_payload,
};

pub struct ItemWorkerContext {
    pub tracker: Arc<dyn TrackerClient>,
    pub fabric: Arc<dyn MessagingFabric>,
    pub log: Arc<VerifiableLog>,
    pub conversation: Arc<MetaDiscussionEngine>,
    pub dependency: Arc<DependencyCoordinator>,
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub node_id: String,
}

/// Drives one claimed item through its full lifecycle. Always decrements
/// `active_task_count` on return, even on early abandonment, so the caller's
/// concurrency bound (testable property 2) never leaks a slot.
pub async fn run_item_worker(
    ctx: Arc<ItemWorkerContext>,
    item: WorkItem,
    active_task_count: Arc<AtomicUsize>,
) -> WorkerState {
    let result = drive(&ctx, &item).await;
    active_task_count.fetch_sub(1, Ordering::SeqCst);
    match result {
        Ok(state) => state,
        Err(e) => {
            warn!(item_id = %item.item_id, "worker error, abandoning: {e}");
            WorkerState::Abandoned
        }
    }
}

async fn drive(ctx: &ItemWorkerContext, item: &WorkItem) -> Result<WorkerState, EngineError> {
    // discovered -> claim_attempt
    match ctx
        .tracker
        .claim_item(&item.project_id, &item.item_id, &ctx.node_id)
        .await?
    {
        ClaimOutcome::Conflict => {
            info!(item_id = %item.item_id, "claim conflict, abandoning");
            return Ok(WorkerState::Abandoned);
        }
        ClaimOutcome::Ok => {}
    }

    // claim_attempt -> claimed
    ctx.log
        .append(
            EventType::TaskClaimed,
            to_payload(&json!({
                "project_id": item.project_id,
                "item_id": item.item_id,
                "claimant": ctx.node_id,
            })),
        )
        .await?;
    ctx.tracker
        .update_item_status(
            &item.project_id,
            &item.item_id,
            StatusUpdate {
                status: ItemStatus::InProgress,
                updated_at: chrono::Utc::now(),
                results: None,
            },
        )
        .await?;
    announce_claim(ctx, item).await?;

    let dependencies = ctx
        .dependency
        .register_claimed_item(
            &item.item_id,
            item.context.get("repository").and_then(|v| v.as_str()).unwrap_or(""),
            &item.title,
            &item.body,
            &ctx.node_id,
        )
        .await?;
    if !dependencies.is_empty() {
        info!(item_id = %item.item_id, count = dependencies.len(), "cross-item dependencies detected");
    }

    // claimed -> planning
    let topic = item_topic(&item.item_id);
    ctx.fabric.join(&topic).await?;
    let prompt = format!("Propose a plan for work item '{}': {}", item.title, item.body);
    let plan = ctx
        .conversation
        .propose_plan(&item.project_id, &item.item_id, &item.title, &prompt)
        .await?;
    if plan == "unable to generate a plan" {
        return help_requested(ctx, item, &topic, "reasoning backend unavailable for planning").await;
    }

    if ctx.conversation.is_escalated(&item.project_id, &item.item_id) {
        return escalated(ctx, item, &topic).await;
    }

    // planning -> executing
    match ctx.sandbox.execute(item).await {
        Ok(outcome) => complete(ctx, item, &topic, outcome).await,
        Err(reason) => help_requested(ctx, item, &topic, &reason).await,
    }
}

async fn announce_claim(ctx: &ItemWorkerContext, item: &WorkItem) -> Result<(), EngineError> {
    let mut payload = EnvelopePayload::new();
    payload.insert("project_id".into(), json!(item.project_id));
    payload.insert("item_id".into(), json!(item.item_id));
    payload.insert("claimant".into(), json!(ctx.node_id));
    ctx.fabric
        .publish(fabric_p2p::COORDINATION_TOPIC, MessageType::TaskClaim, payload)
        .await?;
    Ok(())
}

async fn complete(
    ctx: &ItemWorkerContext,
    item: &WorkItem,
    topic: &str,
    outcome: crate::sandbox::SandboxOutcome,
) -> Result<WorkerState, EngineError> {
    // executing -> pr_created
    ctx.tracker
        .update_item_status(
            &item.project_id,
            &item.item_id,
            StatusUpdate {
                status: ItemStatus::Completed,
                updated_at: chrono::Utc::now(),
                results: Some(outcome.results.clone()),
            },
        )
        .await?;
    ctx.log
        .append(
            EventType::TaskCompleted,
            to_payload(&json!({
                "project_id": item.project_id,
                "item_id": item.item_id,
                "branch": outcome.branch_name,
            })),
        )
        .await?;
    ctx.fabric.leave(topic).await?;
    info!(item_id = %item.item_id, branch = %outcome.branch_name, "item completed");
    Ok(WorkerState::PrCreated)
}

async fn help_requested(
    ctx: &ItemWorkerContext,
    item: &WorkItem,
    topic: &str,
    reason: &str,
) -> Result<WorkerState, EngineError> {
    ctx.log
        .append(
            EventType::TaskHelpRequested,
            to_payload(&json!({
                "project_id": item.project_id,
                "item_id": item.item_id,
                "reason": reason,
            })),
        )
        .await?;
    let mut payload = EnvelopePayload::new();
    payload.insert("item_id".into(), json!(item.item_id));
    payload.insert("repository".into(), item.context.get("repository").cloned().unwrap_or(json!("")));
    payload.insert("reason".into(), json!(reason));
    ctx.fabric.publish(topic, MessageType::TaskHelpRequest, payload).await?;
    ctx.tracker
        .update_item_status(
            &item.project_id,
            &item.item_id,
            StatusUpdate {
                status: ItemStatus::Failed,
                updated_at: chrono::Utc::now(),
                results: None,
            },
        )
        .await?;
    ctx.fabric.leave(topic).await?;
    warn!(item_id = %item.item_id, reason, "requested help, abandoning item");
    Ok(WorkerState::Abandoned)
}

async fn escalated(ctx: &ItemWorkerContext, item: &WorkItem, topic: &str) -> Result<WorkerState, EngineError> {
    ctx.tracker
        .update_item_status(
            &item.project_id,
            &item.item_id,
            StatusUpdate {
                status: ItemStatus::Abandoned,
                updated_at: chrono::Utc::now(),
                results: None,
            },
        )
        .await?;
    ctx.fabric.leave(topic).await?;
    Ok(WorkerState::Escalated)
}
