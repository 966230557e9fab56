//! Local TCP control server: drives a single `AgentConnection` from
//! line-delimited JSON requests sent by an external process.
//!
//! Grounded in `original_source/.../core/local_tcp_server.py`'s wire
//! contract, translated from the teacher's Unix-domain accept-loop shape
//! (`socket/server.rs`) to a plain blocking `TcpListener` since this crate's
//! core is synchronous end to end.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{Context, Result};
use botster_agent::{AgentConnection, Config, ConnectOptions, ReceiveConfig};
use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "botster-agent-ctl", about = "Local control server for a messaging agent")]
struct Args {
    /// Host:port to listen on for control connections.
    #[arg(long, default_value = "127.0.0.1:8765")]
    listen: String,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load();
    let agent = Arc::new(AgentConnection::new(config));

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("binding control socket at {}", args.listen))?;
    log::info!("botster-agent-ctl listening on {}", args.listen);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let agent = Arc::clone(&agent);
                std::thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &agent) {
                        log::warn!("control client error: {e}");
                    }
                });
            }
            Err(e) => log::warn!("control accept error: {e}"),
        }
    }
    Ok(())
}

fn handle_client(stream: TcpStream, agent: &AgentConnection) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => dispatch(agent, &request),
            Err(e) => json!({ "status": "error", "message": format!("malformed request: {e}") }),
        };
        writeln!(writer, "{response}")?;
    }
    Ok(())
}

fn dispatch(agent: &AgentConnection, request: &Value) -> Value {
    match request.get("op").and_then(Value::as_str) {
        Some("connect") => op_connect(agent, request),
        Some("disconnect") => match agent.disconnect() {
            Ok(()) => json!({ "status": "ok" }),
            Err(e) => json!({ "status": "error", "message": e.to_string() }),
        },
        Some("udpPush") => op_udp_push(agent, request),
        Some("udpPull") => op_udp_pull(agent, request),
        Some(other) => json!({ "status": "error", "message": format!("unknown op {other}") }),
        None => json!({ "status": "error", "message": "missing op" }),
    }
}

fn op_connect(agent: &AgentConnection, request: &Value) -> Value {
    let agent_name = request
        .get("agentName")
        .and_then(Value::as_str)
        .unwrap_or("agent")
        .to_string();
    let channel = request.get("channel").and_then(Value::as_str);
    let password = request.get("password").and_then(Value::as_str);
    let opts = match (channel, password) {
        (Some(channel), Some(password)) => ConnectOptions::new(agent_name).channel(channel, password),
        _ => {
            return json!({ "status": "error", "message": "missing channel or password" });
        }
    };
    match agent.connect(opts) {
        Ok(()) => json!({ "status": "ok" }),
        Err(e) => json!({ "status": "error", "message": e.to_string() }),
    }
}

fn op_udp_push(agent: &AgentConnection, request: &Value) -> Value {
    let content = request.get("content").and_then(Value::as_str).unwrap_or("");
    let destination = request
        .get("destination")
        .and_then(Value::as_str)
        .unwrap_or("*");
    match agent.udp_push_message(content, destination) {
        Ok(()) => json!({ "status": "ok" }),
        Err(e) => json!({ "status": "error", "message": e.to_string() }),
    }
}

fn op_udp_pull(agent: &AgentConnection, request: &Value) -> Value {
    let start_offset = request.get("startOffset").and_then(Value::as_i64).unwrap_or(0);
    let limit = request.get("limit").and_then(Value::as_i64).unwrap_or(ReceiveConfig::DEFAULT_LIMIT);
    let receive_config = ReceiveConfig {
        global_offset: start_offset,
        local_offset: 0,
        limit,
        ..ReceiveConfig::new(start_offset, 0)
    };
    match agent.udp_pull(&receive_config) {
        Ok(events) => json!({ "status": "ok", "data": events }),
        Err(e) => json!({ "status": "error", "message": e.to_string() }),
    }
}
