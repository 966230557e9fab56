//! A transport multiplexes the HTTP long-poll path and the UDP
//! request/reply path over the same logical operations (`connect`, `push`,
//! `pull`, `disconnect`, `list-agents`).

pub mod http;
pub mod udp;

pub use http::HttpTransport;
pub use udp::UdpTransport;
