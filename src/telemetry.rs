use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::domain::{ActorId, Operation, UnitTag};

/// Initialize structured logging on stderr.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice is
/// harmless; the second subscriber is simply not installed.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!("SpoolTrack telemetry initialized with structured logging");
    }
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one claim/release/cancel call.
pub fn create_occupation_span(
    action: &str,
    unit_tag: &UnitTag,
    operation: Operation,
    actor: Option<&ActorId>,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "occupation",
        action = action,
        unit.tag = %unit_tag,
        operation = %operation,
        actor.id = actor.map(|a| a.as_str()),
        correlation.id = correlation_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(generate_correlation_id(), generate_correlation_id());
    }

    #[test]
    fn init_twice_does_not_fail() {
        let config = ObservabilityConfig {
            log_level: "warn".to_string(),
            json_logs: false,
        };
        assert!(init_telemetry(&config).is_ok());
        assert!(init_telemetry(&config).is_ok());
    }
}
