use serde::{Deserialize, Serialize};

fn default_poll_interval() -> u64 {
    30
}

fn default_max_tasks() -> usize {
    3
}

fn default_tracker_timeout() -> u64 {
    30
}

fn default_reasoning_timeout() -> u64 {
    60
}

fn default_retry_count() -> u32 {
    3
}

fn default_service_tag() -> String {
    "fabric".into()
}

fn default_coordination_topic() -> String {
    "coordination".into()
}

fn default_meta_topic() -> String {
    "meta_discussion".into()
}

fn default_discovery_timeout() -> u64 {
    10
}

fn default_conversation_limit() -> usize {
    10
}

fn default_escalation_keywords() -> Vec<String> {
    [
        "stuck",
        "help",
        "human",
        "escalate",
        "clarification needed",
        "manual intervention",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_log_output() -> String {
    "stdout".into()
}

/// Top-level configuration, matching the recognized configuration surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub p2p: P2pSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_tracker_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            api_key: None,
            timeout: default_tracker_timeout(),
            retry_count: default_retry_count(),
        }
    }
}

/// Contact details for the generative reasoning backend (§4.5's "Reasoning
/// backend" external collaborator). The distilled configuration surface
/// names only `tracker.*`/`agent.*`/`p2p.*`/`logging.*`; this section fills
/// the gap a real deployment needs to actually reach that collaborator,
/// shaped like `TrackerConfig` since both are bearer-authed HTTP facades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_reasoning_timeout")]
    pub timeout: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".into(),
            api_key: None,
            timeout: default_reasoning_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Node agent identity; auto-derived from the transport peer id when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub specialization: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            capabilities: vec!["general".into()],
            models: Vec::new(),
            specialization: String::new(),
            poll_interval: default_poll_interval(),
            max_tasks: default_max_tasks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pSettings {
    #[serde(default = "default_service_tag")]
    pub service_tag: String,
    #[serde(default = "default_coordination_topic")]
    pub coordination_topic: String,
    #[serde(default = "default_meta_topic")]
    pub meta_topic: String,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout: u64,
    pub escalation_webhook: Option<String>,
    #[serde(default = "default_escalation_keywords")]
    pub escalation_keywords: Vec<String>,
    #[serde(default = "default_conversation_limit")]
    pub conversation_limit: usize,
}

impl Default for P2pSettings {
    fn default() -> Self {
        Self {
            service_tag: default_service_tag(),
            coordination_topic: default_coordination_topic(),
            meta_topic: default_meta_topic(),
            discovery_timeout: default_discovery_timeout(),
            escalation_webhook: None,
            escalation_keywords: default_escalation_keywords(),
            conversation_limit: default_conversation_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default)]
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            structured: false,
        }
    }
}
