//! Telemetry Relay Library
//!
//! This library provides the stages of a telemetry relay agent:
//!
//! - **config**: Environment-based configuration for the relay
//! - **clock**: Time sources shared by samplers and aggregators
//! - **sampler**: Pluggable sample sources, with a simulated sine feed
//! - **aggregator**: Per-channel windowed mean / standard deviation
//! - **batcher**: Grouping of channel summaries into submission messages
//! - **queue**: FIFO hand-off between batcher and submitter
//! - **transport**: HTTP delivery to the collector
//! - **submitter**: Response handling and session-token lifecycle
//! - **pipeline**: Task wiring, periods and shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use telemetry_relay::clock::MonotonicClock;
//! use telemetry_relay::config::Config;
//! use telemetry_relay::pipeline::Pipeline;
//! use telemetry_relay::sampler::SineConfig;
//! use telemetry_relay::transport::HttpTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let transport = HttpTransport::new(&config).expect("Failed to create transport");
//!
//!     let handle = Pipeline::new(&config, Arc::new(transport), Arc::new(MonotonicClock::new()))
//!         .with_sine_channels(config.channels.clone(), &SineConfig::default())
//!         .expect("Failed to create sample sources")
//!         .spawn(CancellationToken::new());
//!
//!     tokio::time::sleep(Duration::from_secs(300)).await;
//!     handle.shutdown(Duration::from_secs(10)).await;
//! }
//! ```

// Module declarations
pub mod aggregator;
pub mod batcher;
pub mod clock;
pub mod config;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod sampler;
pub mod submitter;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use aggregator::{summarize, AggregatorStats, ChannelAggregator};
pub use batcher::{BatcherStats, DeviceIdentity, MeasurementBatcher};
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use config::{Config, ConfigError};
pub use message::{ChannelEntry, ChannelSummary, Message, Sample, WindowRecord};
pub use pipeline::{Periods, Pipeline, PipelineHandle, PipelineReport};
pub use queue::OutboundQueue;
pub use sampler::{SampleSource, SamplerError, SineConfig, SineWaveSource};
pub use submitter::{SubmitError, SubmitOutcome, Submitter, SubmitterStats, TokenChange};
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};
