//! Structured logging configuration.
//!
//! Provides configurable logging with:
//! - JSON output for production (`LOG_FORMAT=json`)
//! - Human-readable output for development (default)
//! - Context fields via spans (queue_key, topic, message_id, ...)
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: set to "json" for JSON output, anything else for text.
//! - `RUST_LOG`: standard log level filter (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging for the given service name. Reads `LOG_FORMAT` and
/// `RUST_LOG` from the environment.
pub fn init_logging(_service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(env_filter);
    } else {
        init_text_logging(env_filter);
    }
}

fn init_json_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();
}

fn init_text_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .init();
}

/// Initialize logging with defaults (service name "reliable-queue").
pub fn init_default_logging() {
    init_logging("reliable-queue");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_parses_with_default_fallback() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        drop(filter);
    }
}
