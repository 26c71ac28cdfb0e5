use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
    /// One JSON object per event instead of the human-readable format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber. Calling it again (tests, embedded use) is
/// a no-op.
pub fn init_tracing(config: &LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_current_span(false).with_target(true));
    let text_layer = (!config.json).then(|| fmt::layer().with_target(true));

    let _ = Registry::default()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing(&LogConfig::default());
        init_tracing(&LogConfig {
            log_level: "debug".into(),
            json: true,
        });
        tracing::info!("still alive");
    }
}
