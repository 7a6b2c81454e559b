//! Tracing setup for processes that host pipeline stages.

use tracing_subscriber::EnvFilter;

use docsync_types::Settings;

use crate::error::PipelineError;

/// `RUST_LOG` directives win over the configured level.
fn build_filter(rust_log: Option<&str>, log_level: &str) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(log_level))
}

/// Install a global fmt subscriber filtered by `RUST_LOG` or
/// `settings.log_level`.
pub fn init_tracing(settings: &Settings) -> Result<(), PipelineError> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_filter(rust_log.as_deref(), &settings.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| PipelineError::Startup(format!("tracing subscriber: {e}")))
}
