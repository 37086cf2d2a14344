//! Wiring of the relay's tasks.
//!
//! ```text
//!  sampler ─┐
//!           ├─ aggregator ─┐
//!  sampler ─┘              │
//!     ...        (one pair per channel)
//!                          ├─ batcher ─ queue ─ submitter ─ collector
//!  sampler ── aggregator ──┘
//! ```
//!
//! The pipeline owns the three periods (sample, downsample, submission) and the
//! task lifecycles. It holds no business data: everything it starts talks only
//! through queues, and one [`CancellationToken`] stops them all.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{run_aggregator, run_sampler, AggregatorStats, ChannelAggregator};
use crate::batcher::{run_batcher, BatcherStats, DeviceIdentity, MeasurementBatcher};
use crate::clock::Clock;
use crate::config::Config;
use crate::queue::OutboundQueue;
use crate::sampler::{SampleSource, SamplerError, SineConfig, SineWaveSource};
use crate::submitter::{Submitter, SubmitterStats};
use crate::transport::Transport;

/// Timing of the three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periods {
    pub sample: Duration,
    pub downsample: Duration,
    pub submission: Duration,
}

impl From<&Config> for Periods {
    fn from(config: &Config) -> Self {
        Self {
            sample: config.sample_interval,
            downsample: config.downsample_interval,
            submission: config.submission_interval,
        }
    }
}

struct Channel {
    name: String,
    source: Box<dyn SampleSource>,
}

/// Builder for the set of relay tasks.
pub struct Pipeline {
    periods: Periods,
    identity: DeviceIdentity,
    queue: OutboundQueue,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    channels: Vec<Channel>,
}

impl Pipeline {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            periods: Periods::from(config),
            identity: DeviceIdentity::new(&config.device_id, &config.device_password),
            queue: OutboundQueue::with_capacity(config.max_pending_messages),
            transport,
            clock,
            channels: Vec::new(),
        }
    }

    /// Add a channel fed by `source`. A channel name added twice replaces the
    /// earlier source.
    pub fn add_channel(mut self, name: impl Into<String>, source: Box<dyn SampleSource>) -> Self {
        let name = name.into();
        self.channels.retain(|c| c.name != name);
        self.channels.push(Channel { name, source });
        self
    }

    /// Add one simulated sine channel per name.
    pub fn with_sine_channels<I, S>(mut self, names: I, sine: &SineConfig) -> Result<Self, SamplerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let source = SineWaveSource::new(sine.clone(), self.clock.clone())?;
            self = self.add_channel(name, Box::new(source));
        }
        Ok(self)
    }

    pub fn periods(&self) -> Periods {
        self.periods
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name.as_str()).collect()
    }

    /// Handle to the message queue, for inspection.
    pub fn queue(&self) -> OutboundQueue {
        self.queue.clone()
    }

    /// Start every task. They run until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> PipelineHandle {
        let (summary_tx, summary_rx) = mpsc::unbounded_channel();
        let mut samplers = Vec::with_capacity(self.channels.len());
        let mut aggregators = Vec::with_capacity(self.channels.len());

        for channel in self.channels {
            let (sample_tx, sample_rx) = mpsc::unbounded_channel();

            aggregators.push(tokio::spawn(run_aggregator(
                ChannelAggregator::new(channel.name.clone()),
                sample_rx,
                self.clock.clone(),
                self.periods.downsample,
                summary_tx.clone(),
                cancel.clone(),
            )));
            samplers.push(tokio::spawn(run_sampler(
                channel.name,
                channel.source,
                self.clock.clone(),
                self.periods.sample,
                sample_tx,
                cancel.clone(),
            )));
        }
        // Only the aggregators hold senders now
        drop(summary_tx);

        let batcher = tokio::spawn(run_batcher(
            MeasurementBatcher::new(self.identity, self.periods.downsample),
            summary_rx,
            self.periods.submission,
            self.queue.clone(),
            cancel.clone(),
        ));

        let submitter = tokio::spawn(
            Submitter::new(self.transport).run(self.queue.clone(), cancel.clone()),
        );

        info!(
            channels = aggregators.len(),
            sample_interval_ms = self.periods.sample.as_millis() as u64,
            downsample_interval_secs = self.periods.downsample.as_secs(),
            submission_interval_secs = self.periods.submission.as_secs(),
            "Pipeline started"
        );

        PipelineHandle {
            cancel,
            queue: self.queue,
            samplers,
            aggregators,
            batcher,
            submitter,
        }
    }
}

/// Final statistics gathered from the stopped tasks.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub aggregators: Vec<AggregatorStats>,
    pub batcher: Option<BatcherStats>,
    pub submitter: Option<SubmitterStats>,
    /// Messages still queued at shutdown
    pub pending_messages: usize,
    /// Messages evicted from a full queue while running
    pub dropped_messages: u64,
}

/// Running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    queue: OutboundQueue,
    samplers: Vec<JoinHandle<()>>,
    aggregators: Vec<JoinHandle<AggregatorStats>>,
    batcher: JoinHandle<BatcherStats>,
    submitter: JoinHandle<SubmitterStats>,
}

impl PipelineHandle {
    /// Token that stops the pipeline when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Cancel every task and wait up to `timeout` for them to finish.
    ///
    /// Queued messages are not flushed. Tasks still running at the deadline
    /// are aborted.
    pub async fn shutdown(self, timeout: Duration) -> PipelineReport {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = PipelineReport::default();

        for handle in self.samplers {
            join_until(handle, deadline, "sampler").await;
        }
        for handle in self.aggregators {
            if let Some(stats) = join_until(handle, deadline, "aggregator").await {
                report.aggregators.push(stats);
            }
        }
        report.batcher = join_until(self.batcher, deadline, "batcher").await;
        report.submitter = join_until(self.submitter, deadline, "submitter").await;
        report.pending_messages = self.queue.len();
        report.dropped_messages = self.queue.dropped();

        if report.pending_messages > 0 {
            info!(pending = report.pending_messages, "Discarding unsent messages");
        }
        report
    }
}

async fn join_until<T>(
    mut handle: JoinHandle<T>,
    deadline: tokio::time::Instant,
    task: &'static str,
) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(task, error = %e, "Task panicked during shutdown");
            None
        }
        Err(_) => {
            warn!(task, "Task shutdown timed out, aborting");
            handle.abort();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::message::Message;
    use crate::testing::ScriptedTransport;
    use chrono::{TimeZone, Utc};
    use reqwest::StatusCode;

    fn scenario_config() -> Config {
        Config {
            sample_interval: Duration::from_millis(200),
            downsample_interval: Duration::from_secs(10),
            submission_interval: Duration::from_secs(60),
            ..Config::default()
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(MonotonicClock::anchored_at(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn constant(value: f64) -> Box<dyn SampleSource> {
        Box::new(move || value)
    }

    #[test]
    fn test_periods_from_config() {
        let periods = Periods::from(&scenario_config());
        assert_eq!(periods.sample, Duration::from_millis(200));
        assert_eq!(periods.downsample, Duration::from_secs(10));
        assert_eq!(periods.submission, Duration::from_secs(60));

        let pipeline = Pipeline::new(
            &scenario_config(),
            Arc::new(ScriptedTransport::new()),
            clock(),
        );
        assert_eq!(pipeline.periods().submission, periods.submission);
    }

    #[test]
    fn test_add_channel_replaces_same_name() {
        let pipeline = Pipeline::new(
            &scenario_config(),
            Arc::new(ScriptedTransport::new()),
            clock(),
        )
        .add_channel("current", constant(1.0))
        .add_channel("potential", constant(2.0))
        .add_channel("current", constant(3.0));

        assert_eq!(pipeline.channel_names(), vec!["potential", "current"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_channel_scenario() {
        let transport = Arc::new(ScriptedTransport::new());
        let handle = Pipeline::new(&scenario_config(), transport.clone(), clock())
            .add_channel("current", constant(1.0))
            .add_channel("potential", constant(230.0))
            .add_channel("frequency", constant(50.0))
            .spawn(CancellationToken::new());

        // Just before the first submission tick nothing has been sent
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(transport.bodies().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);

        let measurement = requests[0]["measurement"].as_array().unwrap();
        assert!(measurement.len() >= 5 && measurement.len() <= 6);
        for record in measurement {
            assert_eq!(record["duration"], 10_000);
            let channels = record["channels"].as_array().unwrap();
            assert!(!channels.is_empty() && channels.len() <= 3);
            for channel in channels {
                assert_eq!(channel["stddev"], 0.0);
            }
        }
        assert!(requests[0].get("token").is_none());

        let report = handle.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.aggregators.len(), 3);
        assert_eq!(report.submitter.unwrap().messages_accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_does_not_affect_next_cycle() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail()
                .respond(StatusCode::OK, r#"{"token": "fresh"}"#),
        );
        let handle = Pipeline::new(&scenario_config(), transport.clone(), clock())
            .add_channel("current", constant(1.0))
            .spawn(CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(121)).await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);

        let first: Vec<i64> = requests[0]["measurement"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect();
        let second: Vec<i64> = requests[1]["measurement"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect();

        // The second message only carries windows of its own submission cycle
        assert!(!second.is_empty());
        assert!(second.iter().all(|t| !first.contains(t)));
        assert!(second.iter().min() > first.iter().max());

        let report = handle.shutdown(Duration::from_secs(5)).await;
        let submitter = report.submitter.unwrap();
        assert_eq!(submitter.transport_failures, 1);
        assert_eq!(submitter.messages_accepted, 1);
        assert_eq!(report.pending_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_tasks() {
        let transport = Arc::new(ScriptedTransport::new());
        let cancel = CancellationToken::new();
        let handle = Pipeline::new(&scenario_config(), transport.clone(), clock())
            .with_sine_channels(["a", "b"], &SineConfig::default())
            .unwrap()
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(15)).await;
        let report = handle.shutdown(Duration::from_secs(1)).await;

        assert!(cancel.is_cancelled());
        assert_eq!(report.aggregators.len(), 2);
        assert!(report.batcher.is_some());
        assert!(report.submitter.is_some());
        // Stopped before the first submission window closed
        assert!(transport.bodies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_counts_evicted_messages() {
        let config = Config {
            max_pending_messages: Some(1),
            ..scenario_config()
        };
        let transport = Arc::new(ScriptedTransport::new());
        let pipeline = Pipeline::new(&config, transport.clone(), clock())
            .add_channel("current", constant(1.0));

        let queue = pipeline.queue();
        for device in ["a", "b", "c"] {
            queue.push(Message::new(device, "pw", Vec::new()));
        }
        assert_eq!(queue.len(), 1);

        let handle = pipeline.spawn(CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.queue().is_empty());

        // Only the newest message survived eviction
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["device_id"], "c");

        let cancel = handle.cancel_token();
        cancel.cancel();
        let report = handle.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.dropped_messages, 2);
        assert_eq!(report.pending_messages, 0);
        assert_eq!(report.submitter.unwrap().messages_accepted, 1);
    }
}
