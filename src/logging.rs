//! # Structured Logging
//!
//! Environment-aware structured logging on top of `tracing-subscriber`.
//! Console output only; format (pretty, compact or JSON) and default filter
//! come from [`LoggingConfig`], while `RUST_LOG` always wins when set.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
///
/// Safe to call repeatedly and from tests: if a global subscriber is already
/// installed the existing one is kept.
pub fn init_tracing(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = build_filter(config, &environment);

        let fmt_layer = match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(config.with_thread_ids)
                .with_current_span(true)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_target(false)
                .with_thread_ids(config.with_thread_ids)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(config.with_thread_ids)
                .with_level(true)
                .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stdout()))
                .boxed(),
        };

        let subscriber = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));

        // A subscriber may already be installed by the host application
        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - keeping existing subscriber"
            );
            return;
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?config.format,
            "🔧 LOGGING: Structured logging initialized"
        );
    });
}

/// Initialize logging with defaults (tests, examples)
pub fn init_default_tracing() {
    init_tracing(&LoggingConfig::default());
}

fn build_filter(config: &LoggingConfig, environment: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = if config.level.is_empty() {
        get_log_level(environment).to_string()
    } else {
        config.level.clone()
    };

    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("AGENTRUNNER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" | "development" => "debug",
        _ => "debug",
    }
}
