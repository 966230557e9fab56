//! Typed error taxonomy for the agent-connection core.
//!
//! The four kinds mirror the error handling design: protocol errors (the
//! server returned a non-success envelope), transport errors (timeouts,
//! refused connections, malformed JSON), cryptographic errors (surfaced only
//! where a caller explicitly asked for a fallible crypto operation — the
//! receive pump itself never propagates these), and precondition violations
//! (the caller invoked something the state machine forbids).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("server returned a non-success response: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("precondition violation: {0}")]
    Precondition(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
