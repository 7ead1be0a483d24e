// Logging/tracing setup for server mode

use chbulk_config::{Config, LogFormat};

/// Initialize tracing from the resolved config. RUST_LOG wins when set;
/// otherwise the debug flag selects the default level.
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Idempotent: ignore the error if a subscriber is already set.
    let _ = match config.log_format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}
