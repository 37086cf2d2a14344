//! In-memory transport for submitter and pipeline tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::transport::{Transport, TransportError, TransportResponse};

/// Replays scripted responses and records every body it was given.
///
/// Once the script runs out it answers `200 {}`.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    bodies: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            bodies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond(self, status: StatusCode, body: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(TransportResponse::new(status, body)));
        self
    }

    pub(crate) fn fail(self) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(TransportError::Timeout));
        self
    }

    pub(crate) fn bodies(&self) -> Vec<String> {
        self.bodies.lock().unwrap().clone()
    }

    pub(crate) fn requests(&self) -> Vec<serde_json::Value> {
        self.bodies()
            .iter()
            .map(|b| serde_json::from_str(b).unwrap())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, body: String) -> Result<TransportResponse, TransportError> {
        self.bodies.lock().unwrap().push(body);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse::new(StatusCode::OK, "{}")))
    }

    fn endpoint(&self) -> &str {
        "memory://collector"
    }
}
