//! Client-side runtime of a channel-based real-time messaging agent SDK.
//!
//! The agent-connection core (see [`connection`]) negotiates a session,
//! derives and bootstraps the shared channel secret, drives the long-poll
//! receive loop with dual offset tracking, verifies/decrypts incoming
//! events, and multiplexes an HTTP long-poll transport and a UDP
//! request/reply transport over one logical connection.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod event;
pub mod model;
pub mod offset;
pub mod session_store;
pub mod transport;

pub use config::Config;
pub use connection::{
    AgentConnection, AllowAll, ApiKeyScope, ConnectOptions, EventHandler, PasswordRequestPolicy,
};
pub use error::{AgentError, Result};
pub use event::{Event, EventEnvelope};
pub use model::{AgentInfo, ChannelCredentials, ChannelState, PollSource, ReceiveConfig, Session};
pub use offset::OffsetTracker;
pub use session_store::{FileSessionStore, InMemorySessionStore, SessionStore};
pub use transport::{HttpTransport, UdpTransport};
