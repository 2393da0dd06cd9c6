mod cli;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use fabric_collab::{EscalationWebhook, HttpReasoningBackend, HttpTrackerClient};
use fabric_engine::{join_static_topics, Agent, AgentSettings};
use fabric_log::VerifiableLog;
use fabric_p2p::{identity::KeypairSigner, transport::load_or_create_keypair, P2pConfig, P2pNode};
use fabric_p2p::{DiscoveryConfig, PeerRegistryVerifier};

use cli::Cli;

/// Clean shutdown, agent's own description.
const EXIT_SUCCESS: i32 = 0;
/// Configuration could not be loaded or parsed.
const EXIT_CONFIG_ERROR: i32 = 1;
/// The P2P transport failed to bind its listen address.
const EXIT_TRANSPORT_ERROR: i32 = 2;
/// The on-disk event log failed its startup hash-chain check.
const EXIT_LOG_INTEGRITY_ERROR: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let config = match fabric_config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };

    init_logging(&config.logging);

    if cli.show_config {
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return EXIT_SUCCESS;
    }

    let data_dir = dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("fabric");
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("failed to create data directory {}: {e}", data_dir.display());
        return EXIT_CONFIG_ERROR;
    }

    let keypair = match load_or_create_keypair(&data_dir.join("identity.key")) {
        Ok(k) => k,
        Err(e) => {
            error!("failed to load or create node identity: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let node_id = libp2p::PeerId::from(keypair.public()).to_string();
    let agent_id = if config.agent.id.is_empty() { node_id.clone() } else { config.agent.id.clone() };

    let log_path: PathBuf = data_dir.join("events.jsonl");
    let verifier = Arc::new(PeerRegistryVerifier::new());
    let log = match VerifiableLog::open(
        Some(log_path.clone()),
        Arc::new(KeypairSigner::new(keypair.clone())),
        verifier.clone(),
    )
    .await
    {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!("event log at {} failed its startup integrity check: {e}", log_path.display());
            return EXIT_LOG_INTEGRITY_ERROR;
        }
    };

    if cli.verify_log {
        return match log.verify_integrity() {
            Ok(()) => {
                info!(entries = log.length(), "event log verified clean");
                EXIT_SUCCESS
            }
            Err(e) => {
                error!("event log integrity violation: {e}");
                EXIT_LOG_INTEGRITY_ERROR
            }
        };
    }

    // ── P2P transport + discovery + messaging fabric (C2/C3/C4) ────────────
    let p2p_config = P2pConfig {
        listen_addr: "/ip4/0.0.0.0/tcp/0".parse().unwrap(),
        discovery: DiscoveryConfig {
            service_tag: config.p2p.service_tag.clone(),
            connect_timeout: std::time::Duration::from_secs(config.p2p.discovery_timeout),
            ..DiscoveryConfig::default()
        },
    };
    let p2p_node = P2pNode::new(p2p_config, keypair, verifier, log.clone());
    let fabric = Arc::new(p2p_node.handle());

    let cancel = CancellationToken::new();
    let p2p_cancel = cancel.clone();
    let p2p_task = tokio::spawn(async move { p2p_node.run(p2p_cancel).await });

    if let Err(e) = join_static_topics(fabric.as_ref()).await {
        error!("failed to join static topics: {e}");
        return EXIT_TRANSPORT_ERROR;
    }

    // ── External collaborators (C5) ─────────────────────────────────────────
    let tracker = Arc::new(HttpTrackerClient::new(
        config.tracker.base_url.clone(),
        config.tracker.api_key.clone(),
        config.tracker.timeout,
        config.tracker.retry_count,
    ));
    let reasoning = Arc::new(HttpReasoningBackend::new(
        config.reasoning.base_url.clone(),
        config.reasoning.api_key.clone(),
        config.reasoning.timeout,
    ));
    let webhook = config.p2p.escalation_webhook.clone().map(EscalationWebhook::new);

    // ── Agent subsystems (C6-C9) ─────────────────────────────────────────────
    let sandbox: Arc<dyn fabric_engine::SandboxRuntime> =
        Arc::new(fabric_engine::MockSandboxRuntime::always_succeeds());

    let settings = AgentSettings {
        node_id: agent_id.clone(),
        capabilities: config.agent.capabilities.clone(),
        models: config.agent.models.clone(),
        specialization: config.agent.specialization.clone(),
        poll_interval: std::time::Duration::from_secs(config.agent.poll_interval),
        max_task_count: config.agent.max_tasks,
        escalation_keywords: config.p2p.escalation_keywords.clone(),
        conversation_limit: config.p2p.conversation_limit,
    };

    let agent = Agent::build(settings, fabric, log, tracker, reasoning, webhook, sandbox);
    let agent_handles = match agent.spawn_all(cancel.clone()).await {
        Ok(h) => h,
        Err(e) => {
            error!("failed to start agent subsystems: {e}");
            cancel.cancel();
            return EXIT_TRANSPORT_ERROR;
        }
    };

    info!(node_id = %agent_id, "fabricd started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        result = p2p_task => {
            match result {
                Ok(Ok(())) => info!("p2p node exited"),
                Ok(Err(e)) => error!("p2p node failed: {e}"),
                Err(e) => error!("p2p task panicked: {e}"),
            }
        }
    }

    cancel.cancel();
    for handle in agent_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }
    EXIT_SUCCESS
}

fn init_logging(config: &fabric_config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let (log_layer, _captured) = fabric_p2p::build_log_channel();
    let registry = tracing_subscriber::registry().with(filter).with(log_layer);
    if config.structured || config.format == "json" {
        let _ = registry.with(fmt::layer().json()).try_init();
    } else {
        let _ = registry.with(fmt::layer().compact()).try_init();
    }
}
