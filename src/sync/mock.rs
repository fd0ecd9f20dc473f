use super::transport::{RemoteResponse, Transport};
use super::wire::{HEALTH_PATH, HEARTBEAT_PATH, REGISTER_PATH};
use crate::error::SyncError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// A request seen by [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

type Scripted = Result<RemoteResponse, SyncError>;

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Scripted>>,
    fallback: HashMap<String, Scripted>,
    offline: bool,
    requests: Vec<RecordedRequest>,
}

/// In-memory [`Transport`] for running the engine without a network.
///
/// Each path answers from its queue of one-shot responses first, then from its
/// fallback, then with 404. While offline every request fails as unreachable.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote that passes the health check and accepts heartbeats and
    /// registration
    pub fn online() -> Self {
        let transport = Self::new();
        transport.respond_always(HEALTH_PATH, 200, r#"{"device": {"status": "ACTIVE"}}"#);
        transport.respond_always(HEARTBEAT_PATH, 200, "{}");
        transport.respond_always(REGISTER_PATH, 200, r#"{"device": {"name": "Edge Reader"}}"#);
        transport
    }

    /// Answer the next request to `path` with this response
    pub fn push(&self, path: &str, status: u16, body: impl Into<String>) {
        self.push_result(path, Ok(RemoteResponse::new(status, body)));
    }

    /// Fail the next request to `path` with this error
    pub fn push_error(&self, path: &str, error: SyncError) {
        self.push_result(path, Err(error));
    }

    fn push_result(&self, path: &str, result: Scripted) {
        self.script
            .lock()
            .queued
            .entry(path.to_string())
            .or_default()
            .push_back(result);
    }

    /// Answer every otherwise unscripted request to `path` with this response
    pub fn respond_always(&self, path: &str, status: u16, body: impl Into<String>) {
        self.script
            .lock()
            .fallback
            .insert(path.to_string(), Ok(RemoteResponse::new(status, body)));
    }

    pub fn set_offline(&self, offline: bool) {
        self.script.lock().offline = offline;
    }

    /// Every request so far, oldest first
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script.lock().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }

    fn answer(&self, request: RecordedRequest) -> Scripted {
        let mut script = self.script.lock();
        let path = request.path.clone();
        script.requests.push(request);

        if script.offline {
            return Err(SyncError::Connectivity {
                details: "scripted transport is offline".to_string(),
            });
        }

        if let Some(next) = script.queued.get_mut(&path).and_then(VecDeque::pop_front) {
            return next;
        }

        script
            .fallback
            .get(&path)
            .cloned()
            .unwrap_or_else(|| Ok(RemoteResponse::new(404, r#"{"message": "Not found"}"#)))
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, path: &str, timeout: Duration) -> Result<RemoteResponse, SyncError> {
        self.answer(RecordedRequest {
            method: "GET",
            path: path.to_string(),
            body: None,
            timeout,
        })
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<RemoteResponse, SyncError> {
        self.answer(RecordedRequest {
            method: "POST",
            path: path.to_string(),
            body: Some(body.clone()),
            timeout,
        })
    }
}
