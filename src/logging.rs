use tracing_subscriber::EnvFilter;

/// Env var consulted when `RUST_LOG` is not set.
pub const LOG_ENV: &str = "RECON_STREAM_LOG";

/// Install a stderr fmt subscriber. `default_level` applies when neither
/// `RUST_LOG` nor `RECON_STREAM_LOG` is set. Safe to call more than once.
pub fn init_logging(default_level: &str) {
    let directive = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV))
        .unwrap_or_else(|_| format!("recon_stream={default_level},tower_http={default_level}"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
