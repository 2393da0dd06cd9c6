use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tracker: {0}")]
    Tracker(#[from] fabric_collab::CollabError),

    #[error("fabric: {0}")]
    Fabric(#[from] fabric_p2p::P2pError),

    #[error("log: {0}")]
    Log(#[from] fabric_log::LogError),

    #[error("worker queue saturated: {0} active tasks already running")]
    Saturated(usize),

    #[error("no reasoning candidates configured")]
    NoCapability,
}
