//! HTTP long-poll transport.
//!
//! Grounded in `original_source/.../util/http_client.py`: a per-process
//! sliding-window throttle (12 requests per 1-second window), a fixed
//! `User-Agent`, and an optional `X-Api-Key` header. Translated into the
//! teacher's `reqwest::blocking::Client` idiom since the core's call shape
//! (throttle, block, return) is synchronous end to end.

use crate::error::{AgentError, Result};
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(40);
const REQUESTS_LIMIT: u32 = 12;
const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ThrottleState {
    window_start: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: Option<String>,
    throttle: Mutex<ThrottleState>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            throttle: Mutex::new(ThrottleState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Blocks until the sliding window has room for one more request, then
    /// reserves the slot. At most [`REQUESTS_LIMIT`] requests are permitted
    /// in any 1-second walltime window.
    fn throttle(&self) {
        let mut state = self.throttle.lock().unwrap();
        let now = Instant::now();
        if now.duration_since(state.window_start) >= WINDOW {
            state.window_start = now;
            state.count = 0;
        }
        state.count += 1;
        if state.count > REQUESTS_LIMIT {
            let elapsed = now.duration_since(state.window_start);
            let sleep_for = WINDOW.saturating_sub(elapsed);
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }
            state.window_start = Instant::now();
            state.count = 1;
        }
    }

    fn post(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value> {
        self.throttle();
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .post(&url)
            .header("User-Agent", USER_AGENT)
            .timeout(timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("X-Api-Key", key.as_str());
        }
        let text = req.send()?.text()?;
        parse_envelope(&text)
    }

    pub fn create_channel(&self, body: &Value) -> Result<Value> {
        self.post("/create-channel", body, DEFAULT_TIMEOUT)
    }

    pub fn connect(&self, body: &Value) -> Result<Value> {
        self.post("/connect", body, DEFAULT_TIMEOUT)
    }

    pub fn pull(&self, body: &Value) -> Result<Value> {
        self.post("/pull", body, PULL_TIMEOUT)
    }

    pub fn push(&self, body: &Value) -> Result<Value> {
        self.post("/push", body, DEFAULT_TIMEOUT)
    }

    pub fn list_agents(&self, body: &Value) -> Result<Value> {
        self.post("/list-agents", body, DEFAULT_TIMEOUT)
    }

    pub fn list_system_agents(&self, body: &Value) -> Result<Value> {
        self.post("/list-system-agents", body, DEFAULT_TIMEOUT)
    }

    pub fn disconnect(&self, body: &Value) -> Result<Value> {
        self.post("/disconnect", body, DEFAULT_TIMEOUT)
    }
}

/// Unwraps the `{status, data}` envelope, also accepting the legacy bare
/// forms: a raw session-id string, a bare event array, or a response dict
/// with no envelope at all.
fn parse_envelope(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text)?;
    match &value {
        Value::Object(obj) => match obj.get("status").and_then(Value::as_str) {
            Some("success") | Some("ok") => Ok(obj.get("data").cloned().unwrap_or(Value::Null)),
            Some(other) => Err(AgentError::Protocol(format!(
                "server returned status {other}"
            ))),
            None => Ok(value),
        },
        _ => Ok(value),
    }
}

/// Looks up a channel-state object under either `state` or the legacy
/// `metadata` key — preserved per spec's backward-compat adapter, flagged
/// there for eventual removal.
pub fn channel_state_value(data: &Value) -> Option<&Value> {
    data.get("state").or_else(|| data.get("metadata"))
}
