//! The agent-connection state machine.
//!
//! `AgentConnection` is the single composable object applications hold: it
//! owns the session lifecycle, the HTTP/UDP transports, the offset tracker,
//! the password-exchange pending request, and the background receive pump.
//! Dependency order is leaves-first: crypto → transport → offsets → pump →
//! this module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::error::{AgentError, Result};
use crate::event::{Event, EventEnvelope};
use crate::model::{ChannelCredentials, ChannelState, ReceiveConfig, Session};
use crate::offset::OffsetTracker;
use crate::session_store::{FileSessionStore, SessionStore};
use crate::transport::{http, HttpTransport, UdpTransport};

const PASSWORD_REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(400);
const DEFAULT_PASSWORD_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PASSWORD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP_IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Scope requested for the developer API key on `/connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyScope {
    Private,
    Public,
}

impl ApiKeyScope {
    fn as_str(self) -> &'static str {
        match self {
            ApiKeyScope::Private => "private",
            ApiKeyScope::Public => "public",
        }
    }
}

impl Default for ApiKeyScope {
    fn default() -> Self {
        ApiKeyScope::Private
    }
}

/// Options for [`AgentConnection::connect`], replacing the overloaded
/// positional/dict/kwargs calling convention of the source SDK.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub channel_password: Option<String>,
    pub agent_name: String,
    pub api_key_scope: ApiKeyScope,
    pub enable_webrtc_relay: bool,
    pub check_last_session: bool,
}

impl ConnectOptions {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            check_last_session: true,
            ..Default::default()
        }
    }

    pub fn channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn channel(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.channel_name = Some(name.into());
        self.channel_password = Some(password.into());
        self
    }

    pub fn api_key_scope(mut self, scope: ApiKeyScope) -> Self {
        self.api_key_scope = scope;
        self
    }

    pub fn enable_webrtc_relay(mut self, enabled: bool) -> Self {
        self.enable_webrtc_relay = enabled;
        self
    }

    pub fn check_last_session(mut self, check: bool) -> Self {
        self.check_last_session = check;
        self
    }

    /// The key the session store and password-exchange continuation are
    /// addressed by: `channelId` when pre-shared, else `channelName`.
    fn recovery_key(&self) -> Option<&str> {
        self.channel_id
            .as_deref()
            .or(self.channel_name.as_deref())
    }
}

/// Auto-responder policy for incoming `password-request` events. Default
/// implementation allows every request.
pub trait PasswordRequestPolicy: Send + Sync {
    fn allow(&self, channel_id: &str, requester_name: &str, requester_public_key: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct AllowAll;

impl PasswordRequestPolicy for AllowAll {
    fn allow(&self, _channel_id: &str, _requester_name: &str, _requester_public_key: &str) -> bool {
        true
    }
}

/// Handler invoked by the receive pump / `receive()` for each delivered
/// event, persistent or ephemeral.
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Ready,
}

/// RSA keypair kept alive for a single outstanding password-request.
struct PendingRequest {
    request_id: Uuid,
    private_key: RsaPrivateKey,
}

/// Everything the state machine mutates, behind one coarse lock per
/// spec's concurrency design: the pump snapshots what it needs under the
/// lock, then releases it for the network call.
struct Shared {
    state: ConnState,
    session: Option<Session>,
    channel_id: Option<String>,
    credentials: ChannelCredentials,
    offsets: Option<OffsetTracker>,
    pending_request: Option<PendingRequest>,
    password_reply_resolved: bool,
    agent_name: String,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: ConnState::Disconnected,
            session: None,
            channel_id: None,
            credentials: ChannelCredentials::default(),
            offsets: None,
            pending_request: None,
            password_reply_resolved: false,
            agent_name: String::new(),
        }
    }
}

struct AgentConnectionInner {
    http: HttpTransport,
    udp: UdpTransport,
    session_store: Box<dyn SessionStore>,
    password_policy: Box<dyn PasswordRequestPolicy>,
    shared: Mutex<Shared>,
    pump_running: AtomicBool,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
}

/// The agent-connection core. Cheap to clone (an `Arc` handle); all state
/// lives behind the inner `Mutex`.
#[derive(Clone)]
pub struct AgentConnection(Arc<AgentConnectionInner>);

impl AgentConnection {
    pub fn new(config: Config) -> Self {
        Self::with_collaborators(
            config,
            Box::new(FileSessionStore::new()),
            Box::new(AllowAll),
        )
    }

    pub fn with_collaborators(
        config: Config,
        session_store: Box<dyn SessionStore>,
        password_policy: Box<dyn PasswordRequestPolicy>,
    ) -> Self {
        let udp_host = config.api_host();
        let inner = AgentConnectionInner {
            http: HttpTransport::new(config.api_url, config.api_key),
            udp: UdpTransport::new(udp_host, config.udp_port),
            session_store,
            password_policy,
            shared: Mutex::new(Shared::new()),
            pump_running: AtomicBool::new(false),
            pump_handle: Mutex::new(None),
        };
        Self(Arc::new(inner))
    }

    fn weak(&self) -> Weak<AgentConnectionInner> {
        Arc::downgrade(&self.0)
    }

    pub fn is_ready(&self) -> bool {
        self.0.shared.lock().unwrap().state == ConnState::Ready
    }

    pub fn channel_id(&self) -> Option<String> {
        self.0.shared.lock().unwrap().channel_id.clone()
    }

    pub fn channel_secret(&self) -> Option<String> {
        self.0
            .shared
            .lock()
            .unwrap()
            .credentials
            .channel_secret
            .clone()
    }

    /// Negotiates a session. Exactly one of `channel_id` or
    /// `channel_name`+`channel_password` must be set on `opts`.
    pub fn connect(&self, opts: ConnectOptions) -> Result<()> {
        {
            let mut shared = self.0.shared.lock().unwrap();
            if shared.state == ConnState::Ready {
                return Err(AgentError::Precondition(
                    "already connected; call disconnect() first".into(),
                ));
            }
            let has_id = opts.channel_id.is_some();
            let has_name_password = opts.channel_name.is_some() && opts.channel_password.is_some();
            if has_id == has_name_password {
                return Err(AgentError::Precondition(
                    "exactly one of channel_id or (channel_name + channel_password) is required"
                        .into(),
                ));
            }
            shared.state = ConnState::Connecting;
            shared.agent_name = opts.agent_name.clone();
        }

        let recovery_key = opts.recovery_key().map(str::to_string);
        let last_session_id = if opts.check_last_session {
            recovery_key
                .as_deref()
                .and_then(|key| self.0.session_store.load(key))
        } else {
            None
        };

        let channel_secret = match (&opts.channel_name, &opts.channel_password) {
            (Some(name), Some(password)) => Some(crypto::derive_channel_secret(name, password)),
            _ => None,
        };
        let password_hash = match (&opts.channel_password, &channel_secret) {
            (Some(password), Some(secret)) => Some(crypto::hash(password, secret)),
            _ => None,
        };

        // Create-channel quirk (spec.md §4.2/§9): when no channelId is known
        // up front, try to register the channel first to obtain one. Any
        // failure here — network, non-success status, or a malformed/deeply
        // nested response — is never fatal; we fall back to sending
        // channelName/channelPassword straight to /connect.
        let created_channel_id = if opts.channel_id.is_none() {
            match (&opts.channel_name, &password_hash) {
                (Some(name), Some(hash)) => self
                    .0
                    .http
                    .create_channel(&json!({ "channelName": name, "channelPassword": hash }))
                    .ok()
                    .and_then(|data| data.get("channelId")?.as_str().map(str::to_string)),
                _ => None,
            }
        } else {
            None
        };

        let mut body = json!({
            "agentName": opts.agent_name,
            "agentContext": { "agentType": "RUST-AGENT", "descriptor": "botster-agent" },
            "enableWebrtcRelay": opts.enable_webrtc_relay,
            "apiKeyScope": opts.api_key_scope.as_str(),
        });
        if let Some(channel_id) = opts.channel_id.as_ref().or(created_channel_id.as_ref()) {
            body["channelId"] = json!(channel_id);
        }
        if let (Some(name), Some(hash)) = (&opts.channel_name, &password_hash) {
            body["channelName"] = json!(name);
            body["channelPassword"] = json!(hash);
        }
        if let Some(session_id) = &last_session_id {
            body["sessionId"] = json!(session_id);
        }

        let data = match self.0.http.connect(&body) {
            Ok(data) => data,
            Err(e) => {
                self.0.shared.lock().unwrap().state = ConnState::Disconnected;
                return Err(e);
            }
        };

        let (session_id, connection_time, channel_state) = match parse_connect_response(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.0.shared.lock().unwrap().state = ConnState::Disconnected;
                return Err(e);
            }
        };
        let channel_id = channel_state.channel_id.clone();
        let offsets = OffsetTracker::new(
            channel_state.original_global_offset,
            channel_state.global_offset,
            channel_state.local_offset,
        );

        {
            let mut shared = self.0.shared.lock().unwrap();
            shared.session = Some(Session {
                session_id: session_id.clone(),
                connection_time,
                channel_id: channel_id.clone(),
            });
            shared.channel_id = Some(channel_id.clone());
            shared.credentials = ChannelCredentials {
                channel_name: opts.channel_name.clone(),
                channel_password: opts.channel_password.clone(),
                channel_secret: channel_secret.clone(),
            };
            shared.offsets = Some(offsets);
            shared.state = ConnState::Ready;
        }

        let store_key = recovery_key.unwrap_or_else(|| channel_id.clone());
        self.0.session_store.save(&store_key, &session_id);

        if channel_secret.is_none() {
            let conn = self.clone();
            std::thread::spawn(move || {
                let _ = conn.request_password(None, DEFAULT_PASSWORD_REQUEST_TIMEOUT);
            });
        }

        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let session_id = {
            let shared = self.0.shared.lock().unwrap();
            shared.session.as_ref().map(|s| s.session_id.clone())
        };
        if let Some(session_id) = session_id {
            let _ = self.0.http.disconnect(&json!({ "sessionId": session_id }));
        }

        let mut shared = self.0.shared.lock().unwrap();
        shared.state = ConnState::Disconnected;
        shared.session = None;
        shared.channel_id = None;
        shared.credentials = ChannelCredentials::default();
        shared.offsets = None;
        shared.pending_request = None;
        drop(shared);

        if let Some(handle) = self.0.pump_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn require_ready(&self) -> Result<(String, Option<String>)> {
        let shared = self.0.shared.lock().unwrap();
        if shared.state != ConnState::Ready {
            return Err(AgentError::Precondition("not connected".into()));
        }
        let session_id = shared
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| AgentError::Precondition("no active session".into()))?;
        Ok((session_id, shared.credentials.channel_secret.clone()))
    }

    /// Sends plaintext or encrypted chat; `destination` is treated as a
    /// literal address unless `as_filter_regex` requests escaping.
    pub fn send_message(
        &self,
        text: &str,
        destination: &str,
        as_filter_regex: bool,
    ) -> Result<()> {
        let to = if as_filter_regex {
            destination.to_string()
        } else {
            regex_escape(destination)
        };
        let (session_id, secret) = self.require_ready()?;
        let (content, encrypted) = match &secret {
            Some(key) => (crypto::encrypt_and_sign(text, key), true),
            None => (text.to_string(), false),
        };
        let body = json!({
            "type": Event::TYPE_CHAT_TEXT,
            "to": to,
            "encrypted": encrypted,
            "content": content,
            "sessionId": session_id,
        });
        self.0.http.push(&body)?;
        Ok(())
    }

    /// Generic event send; `encrypted` is the caller's responsibility
    /// regardless of whether a channel secret is known.
    pub fn send_event(
        &self,
        event_type: &str,
        content: &str,
        to: &str,
        encrypted: bool,
    ) -> Result<()> {
        let (session_id, _) = self.require_ready()?;
        let body = json!({
            "type": event_type,
            "to": to,
            "encrypted": encrypted,
            "content": content,
            "sessionId": session_id,
        });
        self.0.http.push(&body)?;
        Ok(())
    }

    pub fn udp_push_message(&self, text: &str, destination: &str) -> Result<()> {
        let (session_id, secret) = self.require_ready()?;
        let (content, encrypted) = match &secret {
            Some(key) => (crypto::encrypt_and_sign(text, key), true),
            None => (text.to_string(), false),
        };
        let payload = json!({
            "type": Event::TYPE_CHAT_TEXT,
            "to": destination,
            "encrypted": encrypted,
            "content": content,
            "sessionId": session_id,
        });
        self.0.udp.push(&payload);
        Ok(())
    }

    pub fn udp_pull(&self, receive_config: &ReceiveConfig) -> Result<Vec<Event>> {
        let (session_id, _) = self.require_ready()?;
        let payload = json!({ "sessionId": session_id, "receiveConfig": receive_config });
        let data = self.0.udp.pull(&payload);
        Ok(self.process_pull_response(&data))
    }

    /// Synchronous single-shot pull: one round of the pump's loop body,
    /// returned directly rather than dispatched to a handler.
    pub fn receive(&self, receive_config: &ReceiveConfig) -> Result<Vec<Event>> {
        let (session_id, _) = self.require_ready()?;
        let body = json!({ "sessionId": session_id, "receiveConfig": receive_config });
        let data = self.0.http.pull(&body)?;
        Ok(self.process_pull_response(&data))
    }

    /// Starts the background receive pump if not already running; a
    /// second call is a no-op.
    pub fn receive_async(&self, handler: EventHandler) {
        if self.0.pump_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak();
        let builder = std::thread::Builder::new().name("botster-agent-pump".into());
        let handle = builder
            .spawn(move || pump_loop(weak, handler))
            .expect("spawning the receive pump thread");
        *self.0.pump_handle.lock().unwrap() = Some(handle);
    }

    fn process_pull_response(&self, data: &Value) -> Vec<Event> {
        if data.is_null() {
            return Vec::new();
        }
        let secret = self.0.shared.lock().unwrap().credentials.channel_secret.clone();
        let mut events = decrypt_and_collect(data, "ephemeralEvents", secret.as_deref());
        events.extend(decrypt_and_collect(data, "events", secret.as_deref()));

        let next_global = data.get("nextGlobalOffset").and_then(Value::as_i64);
        let next_local = data.get("nextLocalOffset").and_then(Value::as_i64);
        if let Some(offsets) = self.0.shared.lock().unwrap().offsets.as_mut() {
            offsets.promote(next_global, next_local);
        }

        for event in &events {
            self.maybe_handle_protocol_event(event);
        }
        events
    }

    fn connection_time(&self) -> f64 {
        self.0
            .shared
            .lock()
            .unwrap()
            .session
            .as_ref()
            .map(|s| s.connection_time)
            .unwrap_or(0.0)
    }

    /// Auto-intercepts `password-request`/`password-reply` events newer than
    /// this connection's `connectionTime`, per the responder flow. Both are
    /// handled here, in the shared receive path, so a reply is applied
    /// whichever caller's pull happens to observe it first — the background
    /// pump or `request_password`'s own poll loop — rather than only the
    /// latter, which would let the pump silently consume and offset-advance
    /// past a reply meant for a pending request.
    fn maybe_handle_protocol_event(&self, event: &Event) {
        if event.envelope().date <= self.connection_time() {
            return;
        }
        match event {
            Event::PasswordRequest(envelope) => self.handle_password_request(envelope),
            Event::PasswordReply(envelope) => {
                self.apply_password_reply(envelope);
            }
            _ => {}
        }
    }

    fn handle_password_request(&self, envelope: &EventEnvelope) {
        let Ok(content) = serde_json::from_str::<Value>(&envelope.content) else {
            return;
        };
        let (Some(request_id), Some(public_key)) = (
            content.get("requestId").and_then(Value::as_str),
            content.get("publicKeyPem").and_then(Value::as_str),
        ) else {
            return;
        };
        let requester_name = envelope.from.clone().unwrap_or_default();

        let (channel_id, channel_name, channel_password) = {
            let shared = self.0.shared.lock().unwrap();
            (
                shared.channel_id.clone().unwrap_or_default(),
                shared.credentials.channel_name.clone(),
                shared.credentials.channel_password.clone(),
            )
        };
        let (Some(channel_name), Some(channel_password)) = (channel_name, channel_password) else {
            return;
        };
        if !self
            .0
            .password_policy
            .allow(&channel_id, &requester_name, public_key)
        {
            return;
        }

        let reply_payload = json!({ "channelName": channel_name, "channelPassword": channel_password });
        let Ok(encrypted) = crypto::rsa_encrypt(public_key, &reply_payload.to_string()) else {
            return;
        };
        let reply_content = json!({ "requestId": request_id, "data": encrypted }).to_string();
        let _ = self.send_event(Event::TYPE_PASSWORD_REPLY, &reply_content, &requester_name, false);
    }

    /// Requester flow: broadcasts a password-request and polls `receive()`
    /// for a matching reply until `timeout` (clamped to
    /// [`MAX_PASSWORD_REQUEST_TIMEOUT`]) elapses.
    pub fn request_password(&self, timeout: Option<Duration>, default: Duration) -> Result<bool> {
        let timeout = timeout.unwrap_or(default).min(MAX_PASSWORD_REQUEST_TIMEOUT);
        let (session_id, _) = self.require_ready()?;

        let (private_key, public_pem) =
            crypto::rsa_generate().map_err(|e| AgentError::Crypto(e.to_string()))?;
        let request_id = Uuid::new_v4();
        {
            let mut shared = self.0.shared.lock().unwrap();
            shared.pending_request = Some(PendingRequest {
                request_id,
                private_key,
            });
            shared.password_reply_resolved = false;
        }

        let content = json!({ "requestId": request_id.to_string(), "publicKeyPem": public_pem }).to_string();
        let body = json!({
            "type": Event::TYPE_PASSWORD_REQUEST,
            "to": "*",
            "encrypted": false,
            "content": content,
            "sessionId": session_id,
        });
        if self.0.http.push(&body).is_err() {
            self.0.shared.lock().unwrap().pending_request = None;
            return Ok(false);
        }

        let deadline = Instant::now() + timeout;
        let receive_config = self
            .0
            .shared
            .lock()
            .unwrap()
            .offsets
            .as_ref()
            .map(OffsetTracker::current_receive_config)
            .unwrap_or_else(|| ReceiveConfig::new(0, 0));

        // The actual application of a matching reply happens in
        // `maybe_handle_protocol_event`, reached through `receive()` below —
        // but also possibly through a concurrently running `receive_async`
        // pump pulling the very same reply first. Either path sets
        // `password_reply_resolved`, so this loop only needs to observe it.
        let mut resolved = false;
        while Instant::now() < deadline {
            let _ = self.receive(&receive_config);
            if self.0.shared.lock().unwrap().password_reply_resolved {
                resolved = true;
                break;
            }
            std::thread::sleep(PASSWORD_REQUEST_POLL_INTERVAL);
        }

        self.0.shared.lock().unwrap().pending_request = None;
        Ok(resolved)
    }

    /// Reads the pending keypair under the lock each time so a concurrent
    /// `disconnect()` (which clears it) immediately invalidates resolution
    /// in flight, per the "private key cleared on resolution, timeout, or
    /// disconnect" invariant.
    fn apply_password_reply(&self, envelope: &EventEnvelope) -> bool {
        {
            let shared = self.0.shared.lock().unwrap();
            if shared.password_reply_resolved {
                return false;
            }
            if envelope.to.as_deref() != Some(shared.agent_name.as_str()) {
                return false;
            }
        }
        let Some((request_id, private_key)) = self
            .0
            .shared
            .lock()
            .unwrap()
            .pending_request
            .as_ref()
            .map(|p| (p.request_id, clone_private_key(&p.private_key)))
        else {
            return false;
        };

        let (cipher_b64, matches_request) = match serde_json::from_str::<Value>(&envelope.content)
        {
            Ok(value) => {
                let matches = value
                    .get("requestId")
                    .and_then(Value::as_str)
                    .map(|id| id == request_id.to_string())
                    .unwrap_or(true);
                let cipher = value
                    .get("data")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| envelope.content.clone());
                (cipher, matches)
            }
            Err(_) => (envelope.content.clone(), true),
        };
        if !matches_request {
            return false;
        }
        let Ok(plaintext) = crypto::rsa_decrypt(&private_key, &cipher_b64) else {
            return false;
        };
        let (channel_name, channel_password) = match serde_json::from_str::<Value>(&plaintext) {
            Ok(value) => (
                value
                    .get("channelName")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                value
                    .get("channelPassword")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            Err(_) => (None, Some(plaintext.clone())),
        };
        let Some(channel_password) = channel_password else {
            return false;
        };

        let mut shared = self.0.shared.lock().unwrap();
        let name = channel_name
            .or_else(|| shared.credentials.channel_name.clone())
            .unwrap_or_default();
        let secret = crypto::derive_channel_secret(&name, &channel_password);
        shared.credentials.channel_name = Some(name);
        shared.credentials.channel_password = Some(channel_password);
        shared.credentials.channel_secret = Some(secret);
        shared.password_reply_resolved = true;
        true
    }

    pub fn get_active_agents(&self) -> Result<Vec<Value>> {
        let (session_id, _) = self.require_ready()?;
        let data = self.0.http.list_agents(&json!({ "sessionId": session_id }))?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    /// The participant with the smallest `connectionTime` (reading either
    /// the `connectionTime` or legacy `date` key) is the host.
    pub fn is_host_agent(&self) -> Result<bool> {
        let agents = self.get_active_agents()?;
        let my_name = self.0.shared.lock().unwrap().agent_name.clone();
        let my_time = self.connection_time();

        let host = agents.iter().min_by(|a, b| {
            agent_connection_time(a)
                .partial_cmp(&agent_connection_time(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(match host {
            Some(host) => {
                host.get("agentName").and_then(Value::as_str) == Some(my_name.as_str())
                    && agent_connection_time(host) <= my_time
            }
            None => true,
        })
    }
}

fn agent_connection_time(agent: &Value) -> f64 {
    agent
        .get("connectionTime")
        .or_else(|| agent.get("date"))
        .and_then(Value::as_f64)
        .unwrap_or(f64::MAX)
}

fn clone_private_key(key: &RsaPrivateKey) -> RsaPrivateKey {
    key.clone()
}

/// Escapes regex metacharacters so a literal destination filter can be
/// built from arbitrary agent names.
fn regex_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn decrypt_and_collect(data: &Value, key: &str, secret: Option<&str>) -> Vec<Event> {
    let Some(array) = data.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    array
        .iter()
        .filter_map(|raw| {
            let mut raw = raw.clone();
            if let (Some(secret), true) = (
                secret,
                raw.get("encrypted").and_then(Value::as_bool).unwrap_or(false),
            ) {
                if let Some(content) = raw.get("content").and_then(Value::as_str) {
                    if let Some(plain) = crypto::decrypt_and_verify(content, secret) {
                        raw["content"] = json!(plain);
                        raw["encrypted"] = json!(false);
                    }
                }
            }
            serde_json::from_value::<Event>(raw).ok()
        })
        .collect()
}

/// Accepts the server's normal `{sessionId, date, state|metadata}` response
/// plus the backward-compat bare-string / bare-array / unwrapped-dict forms
/// described in spec.md §4.2.
fn parse_connect_response(data: &Value) -> Result<(String, f64, ChannelState)> {
    if let Some(session_id) = data.as_str() {
        return Ok((session_id.to_string(), now_as_epoch_seconds(), ChannelState::default()));
    }
    let session_id = data
        .get("sessionId")
        .and_then(Value::as_str)
        .or_else(|| data.get("session").and_then(Value::as_str))
        .ok_or_else(|| AgentError::Protocol("connect response missing sessionId".into()))?
        .to_string();
    let connection_time = data
        .get("date")
        .or_else(|| data.get("connectionTime"))
        .and_then(Value::as_f64)
        .unwrap_or_else(now_as_epoch_seconds);
    let state_value = http::channel_state_value(data).cloned().unwrap_or(Value::Null);
    let channel_state: ChannelState = serde_json::from_value(state_value).unwrap_or_default();
    Ok((session_id, connection_time, channel_state))
}

fn now_as_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The receive pump's loop body, run on its own daemon thread. Holds only a
/// weak reference so `disconnect` (which drops the last strong `Arc`) isn't
/// blocked by an outstanding pull.
fn pump_loop(weak: Weak<AgentConnectionInner>, handler: EventHandler) {
    loop {
        let Some(inner) = weak.upgrade() else { break };
        let conn = AgentConnection(inner);
        if !conn.is_ready() {
            conn.0.pump_running.store(false, Ordering::SeqCst);
            break;
        }

        let receive_config = conn
            .0
            .shared
            .lock()
            .unwrap()
            .offsets
            .as_ref()
            .map(OffsetTracker::current_receive_config)
            .unwrap_or_else(|| ReceiveConfig::new(0, 0));

        match conn.receive(&receive_config) {
            Ok(events) => {
                for event in &events {
                    handler(event);
                }
            }
            Err(e) => {
                log::warn!("receive pump pull failed, retrying: {e}");
            }
        }
        drop(conn);
        std::thread::sleep(PUMP_IDLE_SLEEP);
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("ready", &self.is_ready())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPublicKey;

    #[test]
    fn regex_escape_escapes_metacharacters() {
        assert_eq!(regex_escape("a.b*c"), "a\\.b\\*c");
        assert_eq!(regex_escape("plain"), "plain");
    }

    #[test]
    fn parse_connect_response_accepts_bare_session_id() {
        let (session_id, _, state) = parse_connect_response(&json!("S1")).unwrap();
        assert_eq!(session_id, "S1");
        assert_eq!(state.channel_id, "");
    }

    #[test]
    fn parse_connect_response_reads_state_and_metadata() {
        let data = json!({
            "sessionId": "S1",
            "date": 100.0,
            "state": { "channelId": "C1", "globalOffset": 42, "localOffset": 7, "originalGlobalOffset": 0 }
        });
        let (session_id, connection_time, state) = parse_connect_response(&data).unwrap();
        assert_eq!(session_id, "S1");
        assert_eq!(connection_time, 100.0);
        assert_eq!(state.channel_id, "C1");
        assert_eq!(state.global_offset, 42);

        let legacy = json!({
            "sessionId": "S2",
            "date": 50.0,
            "metadata": { "channelId": "C2", "globalOffset": 1, "localOffset": 0, "originalGlobalOffset": 0 }
        });
        let (_, _, legacy_state) = parse_connect_response(&legacy).unwrap();
        assert_eq!(legacy_state.channel_id, "C2");
    }

    #[test]
    fn agent_connection_time_prefers_connection_time_over_date() {
        let a = json!({ "connectionTime": 10.0, "date": 20.0 });
        assert_eq!(agent_connection_time(&a), 10.0);
        let b = json!({ "date": 20.0 });
        assert_eq!(agent_connection_time(&b), 20.0);
    }

    #[test]
    fn connect_requires_exactly_one_of_id_or_name_password() {
        let conn = AgentConnection::with_collaborators(
            Config {
                api_url: "http://example.invalid".to_string(),
                ..Config::default()
            },
            Box::new(crate::session_store::InMemorySessionStore::new()),
            Box::new(AllowAll),
        );
        let err = conn.connect(ConnectOptions::new("a1")).unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));

        let err = conn
            .connect(
                ConnectOptions::new("a1")
                    .channel_id("c1")
                    .channel("name", "pw"),
            )
            .unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
    }

    #[test]
    fn send_message_before_connect_is_a_precondition_violation() {
        let conn = AgentConnection::with_collaborators(
            Config {
                api_url: "http://example.invalid".to_string(),
                ..Config::default()
            },
            Box::new(crate::session_store::InMemorySessionStore::new()),
            Box::new(AllowAll),
        );
        let err = conn.send_message("hi", "*", true).unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
    }

    fn envelope_for(to: &str, date: f64, content: String) -> EventEnvelope {
        EventEnvelope {
            from: Some("peer".to_string()),
            to: Some(to.to_string()),
            date,
            content,
            encrypted: false,
            ephemeral: None,
        }
    }

    /// A reply applied once (whether by the pump's `maybe_handle_protocol_event`
    /// path or `request_password`'s own poll loop) must not be re-applied by
    /// the other path when it later observes the same event.
    #[test]
    fn apply_password_reply_is_not_double_applied() {
        let conn = AgentConnection::with_collaborators(
            Config {
                api_url: "http://example.invalid".to_string(),
                ..Config::default()
            },
            Box::new(crate::session_store::InMemorySessionStore::new()),
            Box::new(AllowAll),
        );
        let (private_key, _public_pem) = crypto::rsa_generate().unwrap();
        let request_id = Uuid::new_v4();
        {
            let mut shared = conn.0.shared.lock().unwrap();
            shared.agent_name = "a1".to_string();
            shared.pending_request = Some(PendingRequest {
                request_id,
                private_key: clone_private_key(&private_key),
            });
            shared.credentials.channel_name = Some("default".to_string());
        }

        let cipher = crypto::rsa_encrypt(
            &RsaPublicKey::from(&private_key)
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .unwrap(),
            &json!({ "channelName": "default", "channelPassword": "secret" }).to_string(),
        )
        .unwrap();
        let content = json!({ "requestId": request_id.to_string(), "data": cipher }).to_string();
        let envelope = envelope_for("a1", 1.0, content);

        assert!(conn.apply_password_reply(&envelope));
        assert!(conn.0.shared.lock().unwrap().password_reply_resolved);
        assert_eq!(
            conn.0.shared.lock().unwrap().credentials.channel_password,
            Some("secret".to_string())
        );

        // A second delivery of the same reply (e.g. the other of pump vs.
        // request_password observing it) must be a no-op, not reapplied.
        assert!(!conn.apply_password_reply(&envelope));
    }

    /// `maybe_handle_protocol_event` must dispatch `PasswordReply` events,
    /// not just `PasswordRequest` ones, so the background pump can resolve a
    /// pending `request_password` call even if its own poll loop never sees
    /// the event (the pump consumed and offset-advanced past it first).
    #[test]
    fn maybe_handle_protocol_event_applies_password_replies() {
        let conn = AgentConnection::with_collaborators(
            Config {
                api_url: "http://example.invalid".to_string(),
                ..Config::default()
            },
            Box::new(crate::session_store::InMemorySessionStore::new()),
            Box::new(AllowAll),
        );
        let (private_key, _public_pem) = crypto::rsa_generate().unwrap();
        let request_id = Uuid::new_v4();
        {
            let mut shared = conn.0.shared.lock().unwrap();
            shared.agent_name = "a1".to_string();
            shared.pending_request = Some(PendingRequest {
                request_id,
                private_key: clone_private_key(&private_key),
            });
            shared.credentials.channel_name = Some("default".to_string());
        }

        let cipher = crypto::rsa_encrypt(
            &RsaPublicKey::from(&private_key)
                .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
                .unwrap(),
            &json!({ "channelName": "default", "channelPassword": "secret" }).to_string(),
        )
        .unwrap();
        let content = json!({ "requestId": request_id.to_string(), "data": cipher }).to_string();
        let event = Event::PasswordReply(envelope_for("a1", 1.0, content));

        conn.maybe_handle_protocol_event(&event);

        assert!(conn.0.shared.lock().unwrap().password_reply_resolved);
        assert_eq!(
            conn.0.shared.lock().unwrap().credentials.channel_password,
            Some("secret".to_string())
        );
    }
}
