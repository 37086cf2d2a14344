//! Batching of channel summaries into submission messages.
//!
//! Summaries arrive from every channel aggregator in no particular order. Every
//! submission interval the batcher drains everything pending, groups the
//! summaries by their aggregation timestamp into [`WindowRecord`]s and wraps
//! them into one [`Message`] for the submitter.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::message::{ChannelEntry, ChannelSummary, Message, WindowRecord};
use crate::queue::OutboundQueue;

/// Device credentials stamped on every message.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub password: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            password: password.into(),
        }
    }
}

/// Statistics about batching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatcherStats {
    /// Summaries received from aggregators
    pub summaries_received: u64,

    /// Messages handed to the submitter
    pub messages_built: u64,

    /// Submission cycles that found nothing to send
    pub empty_cycles: u64,
}

/// Accumulates summaries for one submission window.
#[derive(Debug)]
pub struct MeasurementBatcher {
    identity: DeviceIdentity,
    duration_ms: u64,
    pending: Vec<ChannelSummary>,
    stats: BatcherStats,
}

impl MeasurementBatcher {
    /// `window_duration` is the aggregation period recorded on every
    /// [`WindowRecord`].
    pub fn new(identity: DeviceIdentity, window_duration: Duration) -> Self {
        Self {
            identity,
            duration_ms: u64::try_from(window_duration.as_millis()).unwrap_or(u64::MAX),
            pending: Vec::new(),
            stats: BatcherStats::default(),
        }
    }

    pub fn push(&mut self, summary: ChannelSummary) {
        self.stats.summaries_received += 1;
        self.pending.push(summary);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Close the submission window.
    ///
    /// Returns `None` when no summaries arrived. Records are ordered by
    /// timestamp; a repeated channel within one timestamp keeps the value that
    /// arrived last.
    pub fn drain(&mut self) -> Option<Message> {
        let summaries = std::mem::take(&mut self.pending);
        if summaries.is_empty() {
            self.stats.empty_cycles += 1;
            return None;
        }

        let mut windows: BTreeMap<i64, WindowRecord> = BTreeMap::new();
        for summary in summaries {
            let key = summary.window_key();
            windows
                .entry(key)
                .or_insert_with(|| WindowRecord::new(key, self.duration_ms))
                .upsert(ChannelEntry {
                    name: summary.channel,
                    average: summary.average,
                    stddev: summary.stddev,
                });
        }

        self.stats.messages_built += 1;
        Some(Message::new(
            self.identity.device_id.clone(),
            self.identity.password.clone(),
            windows.into_values().collect(),
        ))
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.stats
    }
}

/// Collect summaries and push one message per `submission_interval` onto
/// `queue`. Returns the batching statistics on exit.
pub async fn run_batcher(
    mut batcher: MeasurementBatcher,
    mut rx: mpsc::UnboundedReceiver<ChannelSummary>,
    submission_interval: Duration,
    queue: OutboundQueue,
    cancel: CancellationToken,
) -> BatcherStats {
    let mut ticker = interval(submission_interval);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            maybe_summary = rx.recv() => {
                match maybe_summary {
                    Some(summary) => batcher.push(summary),
                    None => {
                        debug!("All aggregators gone, batcher stopping");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                while let Ok(summary) = rx.try_recv() {
                    batcher.push(summary);
                }

                match batcher.drain() {
                    Some(message) => {
                        debug!(
                            message_id = %message.id,
                            records = message.len(),
                            channels = message.channel_count(),
                            queued = queue.len(),
                            "Message batched"
                        );
                        queue.push(message);
                    }
                    None => debug!("Submission window empty, nothing to send"),
                }
            }
        }
    }

    info!(
        summaries_received = batcher.stats().summaries_received,
        messages_built = batcher.stats().messages_built,
        empty_cycles = batcher.stats().empty_cycles,
        "Batcher stopped"
    );
    batcher.stats().clone()
}
