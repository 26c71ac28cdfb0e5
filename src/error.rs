use thiserror::Error;

// ─── Broker ──────────────────────────────────────────────────────

/// Failures talking to the stream broker. Always treated as transient by
/// the consuming loops.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("consumer group `{group}` does not exist on stream `{stream}`")]
    NoSuchGroup { stream: String, group: String },

    /// Raised by the in-memory broker when a failure has been injected.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

// ─── Store ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Raised by the in-memory store when a failure has been injected.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ─── Configuration ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

// ─── Pipeline ────────────────────────────────────────────────────

/// Umbrella error for component startup and single iterations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("probe client: {0}")]
    ProbeClient(#[from] reqwest::Error),
}
