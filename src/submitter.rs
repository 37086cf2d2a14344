//! Delivery of messages to the collector and session-token management.
//!
//! The submitter is the only owner of the session token. It takes messages
//! from the outbound queue one at a time, injects the current token, posts the
//! message and interprets the response:
//!
//! - `200` with a JSON object: a `token` field replaces the held token if it
//!   differs; other fields are logged.
//! - `401`: the held token is forgotten.
//! - any other status: the body's fields (or the raw body) are logged.
//!
//! A message that is not accepted is dropped, never retried. The next
//! submission window carries fresher data anyway, and retries stay throttled by
//! the submission interval.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::message::Message;
use crate::queue::OutboundQueue;
use crate::transport::{Transport, TransportError};

/// Response field carrying the session token.
pub const TOKEN_FIELD: &str = "token";

/// What a successful response did to the session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenChange {
    /// A new token replaced the held one (or none was held)
    Refreshed,

    /// The response repeated the held token
    Unchanged,

    /// The response carried no token; the held one is kept
    Absent,
}

/// How the collector answered a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 200 with a JSON object body
    Accepted { token: TokenChange },

    /// 401; the session token was cleared
    AuthRejected,

    /// Any other non-200 status
    Rejected { status: StatusCode },

    /// 200 but the body was not a JSON object; token untouched
    MalformedResponse,
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

/// Errors that prevent a submission from getting a response.
#[derive(Debug)]
pub enum SubmitError {
    /// Message could not be serialized
    Serialize(serde_json::Error),

    /// Connection refused, timeout, DNS failure
    Transport(TransportError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Serialize(e) => write!(f, "Failed to serialize message: {}", e),
            SubmitError::Transport(e) => write!(f, "Transport failure: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubmitError::Serialize(e) => Some(e),
            SubmitError::Transport(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for SubmitError {
    fn from(err: serde_json::Error) -> Self {
        SubmitError::Serialize(err)
    }
}

impl From<TransportError> for SubmitError {
    fn from(err: TransportError) -> Self {
        SubmitError::Transport(err)
    }
}

/// Statistics about submitter operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitterStats {
    /// Messages handed to the transport
    pub messages_sent: u64,

    /// Messages the collector accepted
    pub messages_accepted: u64,

    /// Messages dropped for any reason
    pub messages_dropped: u64,

    /// Transport failures
    pub transport_failures: u64,

    /// 401 responses
    pub auth_rejections: u64,

    /// Other non-200 responses
    pub server_errors: u64,

    /// 200 responses with an unusable body
    pub malformed_responses: u64,

    /// Times a new token was taken from a response
    pub token_refreshes: u64,
}

/// Serializes, delivers and tracks the session token.
pub struct Submitter {
    transport: Arc<dyn Transport>,
    token: Option<String>,
    stats: SubmitterStats,
}

impl Submitter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            token: None,
            stats: SubmitterStats::default(),
        }
    }

    /// The session token currently held.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn stats(&self) -> &SubmitterStats {
        &self.stats
    }

    /// Deliver one message.
    ///
    /// Returns how the collector answered, or an error if no answer was
    /// obtained. Either way the message is consumed; nothing is retried.
    pub async fn submit(&mut self, mut message: Message) -> Result<SubmitOutcome, SubmitError> {
        message.token = self.token.clone();

        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                self.stats.messages_dropped += 1;
                return Err(e.into());
            }
        };
        trace!(message_id = %message.id, body = %body, "Serialized message");

        self.stats.messages_sent += 1;
        let response = match self.transport.post(body).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.transport_failures += 1;
                self.stats.messages_dropped += 1;
                return Err(e.into());
            }
        };

        debug!(
            message_id = %message.id,
            status = %response.status,
            "Collector responded"
        );

        let outcome = match response.status {
            StatusCode::OK => self.handle_accepted(&response.body),
            StatusCode::UNAUTHORIZED => {
                self.stats.auth_rejections += 1;
                if self.token.take().is_some() {
                    warn!(message_id = %message.id, "Collector rejected credentials, session token cleared");
                } else {
                    warn!(message_id = %message.id, "Collector rejected credentials");
                }
                SubmitOutcome::AuthRejected
            }
            status => {
                self.stats.server_errors += 1;
                log_error_body(status, &response.body);
                SubmitOutcome::Rejected { status }
            }
        };

        if outcome.is_accepted() {
            self.stats.messages_accepted += 1;
            info!(
                message_id = %message.id,
                records = message.len(),
                channels = message.channel_count(),
                "Message accepted"
            );
        } else {
            self.stats.messages_dropped += 1;
        }

        Ok(outcome)
    }

    fn handle_accepted(&mut self, body: &str) -> SubmitOutcome {
        let fields = match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) | Err(_) => {
                self.stats.malformed_responses += 1;
                warn!(body = %body, "Collector accepted but body is not a JSON object");
                return SubmitOutcome::MalformedResponse;
            }
        };

        for (key, value) in fields.iter().filter(|(k, _)| k.as_str() != TOKEN_FIELD) {
            info!(field = %key, value = %value, "Collector response");
        }

        let token = self.apply_token(&fields);
        SubmitOutcome::Accepted { token }
    }

    fn apply_token(&mut self, fields: &Map<String, Value>) -> TokenChange {
        let new_token = match fields.get(TOKEN_FIELD) {
            Some(Value::String(token)) => token,
            None | Some(Value::Null) => return TokenChange::Absent,
            Some(other) => {
                warn!(value = %other, "Ignoring non-string token in response");
                return TokenChange::Absent;
            }
        };

        if self.token.as_deref() == Some(new_token.as_str()) {
            debug!("Session token unchanged");
            TokenChange::Unchanged
        } else {
            info!("Session token refreshed");
            self.stats.token_refreshes += 1;
            self.token = Some(new_token.clone());
            TokenChange::Refreshed
        }
    }

    /// Consume messages from `queue` strictly in order, one in flight at a
    /// time, until cancelled. Returns the final statistics.
    pub async fn run(mut self, queue: OutboundQueue, cancel: CancellationToken) -> SubmitterStats {
        info!(endpoint = %self.transport.endpoint(), "Submitter started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = queue.pop() => message,
            };
            let message_id = message.id;

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(message_id = %message_id, "Shutdown during submission, message abandoned");
                    break;
                }
                result = self.submit(message) => {
                    if let Err(e) = result {
                        error!(message_id = %message_id, error = %e, "Submission failed, message dropped");
                    }
                }
            }
        }

        info!(
            messages_sent = self.stats.messages_sent,
            messages_accepted = self.stats.messages_accepted,
            messages_dropped = self.stats.messages_dropped,
            auth_rejections = self.stats.auth_rejections,
            token_refreshes = self.stats.token_refreshes,
            pending = queue.len(),
            "Submitter stopped"
        );
        self.stats
    }
}

/// Log a non-200 body field by field when it is a JSON object, raw otherwise.
fn log_error_body(status: StatusCode, body: &str) {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => {
            for (key, value) in &fields {
                warn!(status = %status, field = %key, value = %value, "Collector error");
            }
            if fields.is_empty() {
                warn!(status = %status, "Collector error with empty body");
            }
        }
        _ => warn!(status = %status, body = %body, "Collector returned non-JSON error"),
    }
}
