//! Internal code for tracing/logging.
//!
//! Logging to stdout is always enabled, at least at the "ERROR"
//! level for this crate's target.
//!
//! The output can also be configured with an env var:
//! "EPOCHFLOW_LOG". If set, it takes precedence over the level passed
//! to [`setup_tracing`].
//!
//! See tracing-subscriber's documentation:
//! https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
//!
//! eg: to set epochflow's logs to the "debug" level, and all other
//! packages to the "error" level:
//!     $ EPOCHFLOW_LOG="epochflow=debug,error" ./my-dataflow

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::RecoveryError;
use crate::errors::RecoveryResult;

const LOG_ENV_VAR: &str = "EPOCHFLOW_LOG";

pub(crate) fn get_log_level(level: Option<&str>) -> RecoveryResult<LevelFilter> {
    match level.map(str::to_lowercase).as_deref() {
        None => Ok(LevelFilter::ERROR),
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some(level) => Err(RecoveryError::Config(format!("wrong log level: {level}"))),
    }
}

fn log_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
}

/// Install the global log subscriber.
///
/// Calling this more than once in a process logs a warning and keeps
/// the first subscriber.
pub fn setup_tracing(log_level: Option<&str>) -> RecoveryResult<()> {
    let log_level = get_log_level(log_level)?;

    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives).map_err(|err| {
                RecoveryError::Config(format!("invalid {LOG_ENV_VAR} {directives:?}: {err}"))
            })?;
            set_global_subscriber(Registry::default().with(log_layer().with_filter(filter)));
        }
        Err(_) => {
            let filter = Targets::new().with_target("epochflow", log_level);
            set_global_subscriber(Registry::default().with(log_layer().with_filter(filter)));
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // in tests and if an execution is run more than once in the same
    // process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse() {
        assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
        assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
        assert!(get_log_level(Some("loud")).is_err());
    }

    #[test]
    fn setup_twice_does_not_fail() {
        setup_tracing(Some("info")).unwrap();
        setup_tracing(Some("info")).unwrap();
    }
}
