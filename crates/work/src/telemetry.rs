//! Tracing initialisation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{OrchestratorError, Result};

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` overrides `config.level`. Installing a second subscriber
/// returns [`OrchestratorError::Telemetry`] and leaves the first in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| OrchestratorError::Telemetry(format!("bad level {:?}: {e}", config.level)))?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Full => registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(config.with_target))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(config.with_target))
            .try_init(),
    };
    installed.map_err(|e| OrchestratorError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_an_error() {
        // Another test may already have installed one; either way the
        // second call must fail without panicking.
        let _ = init_tracing(&LoggingConfig::default());
        assert!(matches!(
            init_tracing(&LoggingConfig::default()),
            Err(OrchestratorError::Telemetry(_))
        ));
    }

    #[test]
    fn test_bad_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "conductor=verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_tracing(&config), Err(OrchestratorError::Telemetry(_))));
    }
}
