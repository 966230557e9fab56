//! UDP request/reply transport.
//!
//! Grounded in `original_source/.../api/impl/udp_client.py` and
//! `udp_envelope.py`: a single unconnected datagram socket, a JSON envelope
//! `{action, payload, requestId?}`, fire-and-forget pushes, and a 3-second
//! receive deadline for pulls. Any timeout or malformed/non-success reply is
//! treated as an empty result, never as an error to surface.

use serde_json::Value;
use std::net::UdpSocket;
use std::time::Duration;
use uuid::Uuid;

const PULL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct UdpTransport {
    host: String,
    port: u16,
}

impl UdpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn send_envelope(
        &self,
        action: &str,
        payload: &Value,
        request_id: Option<&str>,
        read_timeout: Option<Duration>,
    ) -> std::io::Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(read_timeout)?;
        let mut envelope = serde_json::json!({ "action": action, "payload": payload });
        if let Some(rid) = request_id {
            envelope["requestId"] = Value::String(rid.to_string());
        }
        let bytes = serde_json::to_vec(&envelope)?;
        socket.send_to(&bytes, (self.host.as_str(), self.port))?;
        Ok(socket)
    }

    /// Fire-and-forget push. Send failures are logged, never surfaced.
    pub fn push(&self, payload: &Value) {
        if let Err(e) = self.send_envelope("push", payload, None, None) {
            log::warn!("udp push failed: {e}");
        }
    }

    /// Sends a pull request and blocks for a reply up to [`PULL_TIMEOUT`].
    /// Returns the unwrapped `data` payload, or `Value::Null` on any
    /// timeout, malformed reply, or non-success status at either layer of
    /// the envelope.
    pub fn pull(&self, payload: &Value) -> Value {
        let request_id = Uuid::new_v4().to_string();
        let socket = match self.send_envelope("pull", payload, Some(&request_id), Some(PULL_TIMEOUT))
        {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("udp pull send failed: {e}");
                return Value::Null;
            }
        };

        let mut buf = [0u8; 65536];
        match socket.recv(&mut buf) {
            Ok(n) => serde_json::from_slice::<Value>(&buf[..n])
                .ok()
                .and_then(|reply| extract_result(&reply))
                .unwrap_or(Value::Null),
            Err(_) => Value::Null,
        }
    }
}

fn extract_result(reply: &Value) -> Option<Value> {
    if reply.get("status").and_then(Value::as_str) != Some("ok") {
        return None;
    }
    let result = reply.get("result")?;
    if result.get("status").and_then(Value::as_str) != Some("success") {
        return None;
    }
    Some(result.get("data").cloned().unwrap_or(Value::Null))
}
