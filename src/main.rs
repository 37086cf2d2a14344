//! Telemetry Relay - windowed sensor telemetry forwarder
//!
//! This service samples one or more channels, aggregates each channel into
//! fixed windows, batches the windows into messages and submits them to a
//! remote collector, keeping the collector's session token up to date.
//!
//! ## Features
//!
//! - One sampler and one aggregator task per channel
//! - Time-based batching with a single in-order submitter
//! - Session-token refresh and invalidation
//! - Graceful shutdown on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables, see
//! [`telemetry_relay::config::Config`]. `RUST_LOG` overrides
//! `RELAY_LOG_LEVEL` when both are set.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use telemetry_relay::clock::MonotonicClock;
use telemetry_relay::config::Config;
use telemetry_relay::pipeline::Pipeline;
use telemetry_relay::sampler::SineConfig;
use telemetry_relay::transport::HttpTransport;

/// How long running tasks get to stop after Ctrl+C
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Configuration first: it carries the log level
    let config = Config::from_env();
    init_tracing(config.as_ref().map(|c| c.log_level.as_str()).unwrap_or("info"));

    info!("Starting Telemetry Relay...");

    let config = match config {
        Ok(config) => {
            info!(
                submit_url = %config.submit_url(),
                channels = ?config.channels,
                sample_interval_ms = config.sample_interval.as_millis() as u64,
                downsample_interval_secs = config.downsample_interval.as_secs(),
                submission_interval_secs = config.submission_interval.as_secs(),
                auth = config.auth_enabled,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let transport = match HttpTransport::new(&config) {
        Ok(transport) => {
            info!(url = %transport.url(), "HTTP transport initialized");
            Arc::new(transport)
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP transport");
            std::process::exit(1);
        }
    };

    let pipeline = Pipeline::new(&config, transport, Arc::new(MonotonicClock::new()))
        .with_sine_channels(config.channels.iter().cloned(), &SineConfig::default());
    let pipeline = match pipeline {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Failed to create sample sources");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let handle = pipeline.spawn(cancel.clone());

    // Wait for shutdown signal
    info!("Telemetry Relay running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    let report = handle.shutdown(SHUTDOWN_TIMEOUT).await;
    match &report.submitter {
        Some(stats) => info!(
            messages_accepted = stats.messages_accepted,
            messages_dropped = stats.messages_dropped,
            evicted = report.dropped_messages,
            discarded = report.pending_messages,
            "Telemetry Relay stopped"
        ),
        None => warn!("Telemetry Relay stopped without submitter statistics"),
    }
}

/// Initialize the tracing subscriber, `RUST_LOG` first, then the configured level.
fn init_tracing(default_level: &str) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (filter, rejected) = build_filter(rust_log.as_deref(), default_level);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    if let Some(e) = rejected {
        warn!(level = default_level, error = %e, "Invalid RELAY_LOG_LEVEL, using info");
    }
}

/// Pick the log filter. Returns the parse error when the configured level
/// was unusable and `info` was used instead.
fn build_filter(rust_log: Option<&str>, default_level: &str) -> (EnvFilter, Option<ParseError>) {
    if let Some(filter) = rust_log.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return (filter, None);
    }
    match EnvFilter::try_new(default_level) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used_without_rust_log() {
        let (filter, rejected) = build_filter(None, "debug");
        assert!(rejected.is_none());
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_rust_log_takes_precedence() {
        let (filter, rejected) = build_filter(Some("telemetry_relay=trace"), "relay=loud");
        assert!(rejected.is_none());
        assert_eq!(filter.to_string(), "telemetry_relay=trace");
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        let (filter, rejected) = build_filter(None, "relay=loud");
        assert!(rejected.is_some());
        assert_eq!(filter.to_string(), "info");
    }
}
