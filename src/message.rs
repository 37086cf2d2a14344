//! Data model shared by the pipeline stages and the collector wire format.
//!
//! A [`Sample`] becomes part of a [`ChannelSummary`] once per aggregation
//! window. Summaries from every channel are grouped by timestamp into
//! [`WindowRecord`]s, and the records of one submission window travel to the
//! collector inside a single [`Message`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw reading taken from a channel's sample source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, channel: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp,
            channel: channel.into(),
            value,
        }
    }
}

/// Statistics of one channel over one aggregation window.
///
/// `timestamp` is the time the window was drained, not the time of any sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSummary {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub average: f64,
    pub stddev: f64,
}

impl ChannelSummary {
    /// Timestamp truncated to whole seconds, the key windows are grouped by.
    pub fn window_key(&self) -> i64 {
        self.timestamp.timestamp()
    }
}

/// A channel's statistics as they appear inside a [`WindowRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    pub average: f64,
    pub stddev: f64,
}

/// All channel summaries that share one aggregation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    /// Unix seconds
    pub timestamp: i64,

    /// Length of the aggregation window in milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: u64,

    /// Unique by `name`, in order of first insertion
    pub channels: Vec<ChannelEntry>,
}

impl WindowRecord {
    pub fn new(timestamp: i64, duration_ms: u64) -> Self {
        Self {
            timestamp,
            duration_ms,
            channels: Vec::new(),
        }
    }

    /// Insert a channel entry. A later entry for the same channel name
    /// replaces the earlier one in place.
    pub fn upsert(&mut self, entry: ChannelEntry) {
        match self.channels.iter_mut().find(|c| c.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.channels.push(entry),
        }
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelEntry> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// One submission to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Local correlation id for log lines; never sent
    #[serde(skip)]
    pub id: Uuid,

    pub device_id: String,

    pub password: String,

    /// Session token, injected by the submitter right before serialization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(rename = "measurement")]
    pub records: Vec<WindowRecord>,
}

impl Message {
    /// Create a message without a token.
    pub fn new(
        device_id: impl Into<String>,
        password: impl Into<String>,
        records: Vec<WindowRecord>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            password: password.into(),
            token: None,
            records,
        }
    }

    /// Number of window records in the message.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total channel entries across all records.
    pub fn channel_count(&self) -> usize {
        self.records.iter().map(WindowRecord::len).sum()
    }
}
