use thiserror::Error;

/// All errors produced by podium-core.
///
/// Level ingestion never fails; these only surface from construction,
/// configuration and scheduler management.
#[derive(Debug, Error)]
pub enum PodiumError {
    #[error("invalid detector config: {field} {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },

    #[error("invalid config JSON: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("failed to spawn decision scheduler: {0}")]
    SchedulerSpawn(#[source] std::io::Error),

    #[error("detector has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, PodiumError>;
