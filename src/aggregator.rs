//! Per-channel windowed aggregation.
//!
//! Each channel runs two tasks: a sampler that pulls one reading from its
//! [`SampleSource`] every sample interval, and an aggregator that buffers those
//! readings and, every downsample interval, reduces them to one
//! [`ChannelSummary`] (mean and population standard deviation).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::clock::Clock;
use crate::message::{ChannelSummary, Sample};
use crate::sampler::SampleSource;

/// Mean and population standard deviation of `values`.
///
/// Returns `None` for an empty slice.
pub fn summarize(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Statistics about one channel's aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatorStats {
    /// Samples pushed into the window buffer
    pub samples_received: u64,

    /// Windows that produced a summary
    pub windows_emitted: u64,

    /// Windows that closed with no samples
    pub empty_windows: u64,
}

/// Window buffer for a single channel.
#[derive(Debug)]
pub struct ChannelAggregator {
    channel: String,
    buffer: Vec<f64>,
    stats: AggregatorStats,
}

impl ChannelAggregator {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            buffer: Vec::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Add a reading to the current window.
    pub fn push(&mut self, value: f64) {
        self.stats.samples_received += 1;
        self.buffer.push(value);
    }

    /// Number of readings in the current window.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Close the current window.
    ///
    /// Takes every buffered reading and starts an empty window. Returns the
    /// summary stamped with `now`, or `None` if the window had no readings.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Option<ChannelSummary> {
        let values = std::mem::take(&mut self.buffer);

        let Some((average, stddev)) = summarize(&values) else {
            self.stats.empty_windows += 1;
            return None;
        };

        self.stats.windows_emitted += 1;
        debug!(
            channel = %self.channel,
            samples = values.len(),
            average,
            stddev,
            "Window aggregated"
        );

        Some(ChannelSummary {
            timestamp: now,
            channel: self.channel.clone(),
            average,
            stddev,
        })
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }
}

/// Pull one reading from `source` every `sample_interval` until cancelled or
/// the aggregator side goes away.
pub async fn run_sampler(
    channel: String,
    mut source: Box<dyn SampleSource>,
    clock: Arc<dyn Clock>,
    sample_interval: Duration,
    tx: mpsc::UnboundedSender<Sample>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(sample_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let value = source.next_sample();
                trace!(channel = %channel, value, "Sample taken");

                if tx.send(Sample::new(clock.now(), channel.as_str(), value)).is_err() {
                    debug!(channel = %channel, "Aggregator gone, sampler stopping");
                    break;
                }
            }
        }
    }
}

/// Buffer samples for one channel and emit a summary every
/// `downsample_interval`. Returns the aggregation statistics on exit.
pub async fn run_aggregator(
    mut aggregator: ChannelAggregator,
    mut rx: mpsc::UnboundedReceiver<Sample>,
    clock: Arc<dyn Clock>,
    downsample_interval: Duration,
    out: mpsc::UnboundedSender<ChannelSummary>,
    cancel: CancellationToken,
) -> AggregatorStats {
    let mut ticker = interval(downsample_interval);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            maybe_sample = rx.recv() => {
                match maybe_sample {
                    Some(sample) => aggregator.push(sample.value),
                    None => {
                        debug!(channel = %aggregator.channel(), "Sampler gone, aggregator stopping");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                // Everything already queued belongs to the closing window
                while let Ok(sample) = rx.try_recv() {
                    aggregator.push(sample.value);
                }

                if let Some(summary) = aggregator.drain(clock.now()) {
                    if out.send(summary).is_err() {
                        debug!(channel = %aggregator.channel(), "Batcher gone, aggregator stopping");
                        break;
                    }
                }
            }
        }
    }

    info!(
        channel = %aggregator.channel(),
        samples_received = aggregator.stats().samples_received,
        windows_emitted = aggregator.stats().windows_emitted,
        empty_windows = aggregator.stats().empty_windows,
        "Aggregator stopped"
    );
    aggregator.stats().clone()
}
