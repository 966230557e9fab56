//! Connect → send → receive happy path against a mocked HTTP server,
//! following the first two end-to-end scenarios of the connect/send spec.

use botster_agent::{AgentConnection, Config, ConnectOptions, Event, ReceiveConfig};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn start_mock_server() -> (tokio::runtime::Runtime, MockServer) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let server = rt.block_on(MockServer::start());
    (rt, server)
}

#[test]
fn connect_populates_channel_state_and_derives_secret() {
    let (rt, server) = start_mock_server();
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "sessionId": "S1",
                    "date": 100.0,
                    "state": {
                        "channelId": "C1",
                        "globalOffset": 42,
                        "localOffset": 7,
                        "originalGlobalOffset": 0
                    }
                }
            })))
            .mount(&server),
    );

    let config = Config {
        api_url: server.uri(),
        ..Config::default()
    };
    let agent = AgentConnection::with_collaborators(
        config,
        Box::new(botster_agent::InMemorySessionStore::new()),
        Box::new(botster_agent::AllowAll),
    );

    agent
        .connect(ConnectOptions::new("a1").channel("default", "default"))
        .expect("connect succeeds against the mock server");

    assert_eq!(agent.channel_id(), Some("C1".to_string()));
    assert!(agent.channel_secret().is_some());
    assert_eq!(
        agent.channel_secret().unwrap(),
        botster_agent::crypto::derive_channel_secret("default", "default")
    );
}

#[test]
fn send_message_posts_an_encrypted_push_the_derived_secret_can_decrypt() {
    let (rt, server) = start_mock_server();
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "sessionId": "S1",
                    "date": 100.0,
                    "state": {
                        "channelId": "C1",
                        "globalOffset": 0,
                        "localOffset": 0,
                        "originalGlobalOffset": 0
                    }
                }
            })))
            .mount(&server),
    );
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/push"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {}
            })))
            .mount(&server),
    );

    let config = Config {
        api_url: server.uri(),
        ..Config::default()
    };
    let agent = AgentConnection::with_collaborators(
        config,
        Box::new(botster_agent::InMemorySessionStore::new()),
        Box::new(botster_agent::AllowAll),
    );
    agent
        .connect(ConnectOptions::new("a1").channel("default", "default"))
        .unwrap();

    agent.send_message("hello", "*", true).unwrap();

    let requests = rt.block_on(async { server.received_requests().await.unwrap() });
    let push = requests
        .iter()
        .find(|r| r.url.path() == "/push")
        .expect("one push request was sent");
    let body: serde_json::Value = push.body_json().unwrap();
    assert_eq!(body["type"], "chat-text");
    assert_eq!(body["encrypted"], true);

    let secret = agent.channel_secret().unwrap();
    let plaintext = botster_agent::crypto::decrypt_and_verify(
        body["content"].as_str().unwrap(),
        &secret,
    )
    .unwrap();
    assert_eq!(plaintext, "hello");
}

#[test]
fn connect_uses_channel_id_from_create_channel_when_available() {
    let (rt, server) = start_mock_server();
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/create-channel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "channelId": "created-1" }
            })))
            .mount(&server),
    );
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "sessionId": "S1",
                    "date": 100.0,
                    "state": {
                        "channelId": "created-1",
                        "globalOffset": 0,
                        "localOffset": 0,
                        "originalGlobalOffset": 0
                    }
                }
            })))
            .mount(&server),
    );

    let config = Config {
        api_url: server.uri(),
        ..Config::default()
    };
    let agent = AgentConnection::with_collaborators(
        config,
        Box::new(botster_agent::InMemorySessionStore::new()),
        Box::new(botster_agent::AllowAll),
    );
    agent
        .connect(ConnectOptions::new("a1").channel("default", "default"))
        .unwrap();

    let requests = rt.block_on(async { server.received_requests().await.unwrap() });
    let connect_req = requests
        .iter()
        .find(|r| r.url.path() == "/connect")
        .expect("one connect request was sent");
    let body: serde_json::Value = connect_req.body_json().unwrap();
    assert_eq!(body["channelId"], "created-1");
    assert_eq!(body["channelName"], "default");
}

#[test]
fn connect_falls_back_to_name_password_when_create_channel_fails() {
    let (rt, server) = start_mock_server();
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/create-channel"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server),
    );
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "sessionId": "S1",
                    "date": 100.0,
                    "state": {
                        "channelId": "C1",
                        "globalOffset": 0,
                        "localOffset": 0,
                        "originalGlobalOffset": 0
                    }
                }
            })))
            .mount(&server),
    );

    let config = Config {
        api_url: server.uri(),
        ..Config::default()
    };
    let agent = AgentConnection::with_collaborators(
        config,
        Box::new(botster_agent::InMemorySessionStore::new()),
        Box::new(botster_agent::AllowAll),
    );
    agent
        .connect(ConnectOptions::new("a1").channel("default", "default"))
        .expect("create-channel failure must not prevent connect from succeeding");

    let requests = rt.block_on(async { server.received_requests().await.unwrap() });
    let connect_req = requests
        .iter()
        .find(|r| r.url.path() == "/connect")
        .expect("one connect request was sent");
    let body: serde_json::Value = connect_req.body_json().unwrap();
    assert!(body.get("channelId").is_none());
    assert_eq!(body["channelName"], "default");
}

#[test]
fn receive_decrypts_events_and_advances_offsets() {
    let (rt, server) = start_mock_server();
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "sessionId": "S1",
                    "date": 100.0,
                    "state": {
                        "channelId": "C1",
                        "globalOffset": 0,
                        "localOffset": 0,
                        "originalGlobalOffset": 0
                    }
                }
            })))
            .mount(&server),
    );

    let config = Config {
        api_url: server.uri(),
        ..Config::default()
    };
    let agent = AgentConnection::with_collaborators(
        config,
        Box::new(botster_agent::InMemorySessionStore::new()),
        Box::new(botster_agent::AllowAll),
    );
    agent
        .connect(ConnectOptions::new("a1").channel("default", "default"))
        .unwrap();
    let secret = agent.channel_secret().unwrap();

    let cipher = botster_agent::crypto::encrypt_and_sign("hi there", &secret);
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "events": [{
                        "type": "chat-text",
                        "from": "a2",
                        "to": null,
                        "date": 200.0,
                        "content": cipher,
                        "encrypted": true
                    }],
                    "ephemeralEvents": [],
                    "nextGlobalOffset": 1,
                    "nextLocalOffset": 1
                }
            })))
            .mount(&server),
    );

    let events = agent
        .receive(&ReceiveConfig::new(0, 0))
        .expect("pull succeeds");
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::ChatText(envelope) => {
            assert_eq!(envelope.content, "hi there");
            assert!(!envelope.encrypted);
        }
        other => panic!("expected ChatText, got {other:?}"),
    }
}

#[test]
fn receive_dispatches_ephemeral_events_before_persistent_ones() {
    let (rt, server) = start_mock_server();
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "sessionId": "S1",
                    "date": 100.0,
                    "state": {
                        "channelId": "C1",
                        "globalOffset": 0,
                        "localOffset": 0,
                        "originalGlobalOffset": 0
                    }
                }
            })))
            .mount(&server),
    );

    let config = Config {
        api_url: server.uri(),
        ..Config::default()
    };
    let agent = AgentConnection::with_collaborators(
        config,
        Box::new(botster_agent::InMemorySessionStore::new()),
        Box::new(botster_agent::AllowAll),
    );
    agent
        .connect(ConnectOptions::new("a1").channel("default", "default"))
        .unwrap();
    let secret = agent.channel_secret().unwrap();

    let persistent_cipher = botster_agent::crypto::encrypt_and_sign("persistent", &secret);
    let ephemeral_cipher = botster_agent::crypto::encrypt_and_sign("ephemeral", &secret);
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": {
                    "events": [{
                        "type": "chat-text",
                        "from": "a2",
                        "to": null,
                        "date": 200.0,
                        "content": persistent_cipher,
                        "encrypted": true
                    }],
                    "ephemeralEvents": [{
                        "type": "chat-text",
                        "from": "a2",
                        "to": null,
                        "date": 200.0,
                        "content": ephemeral_cipher,
                        "encrypted": true
                    }],
                    "nextGlobalOffset": 1,
                    "nextLocalOffset": 1
                }
            })))
            .mount(&server),
    );

    let events = agent
        .receive(&ReceiveConfig::new(0, 0))
        .expect("pull succeeds");
    assert_eq!(events.len(), 2);
    match (&events[0], &events[1]) {
        (Event::ChatText(first), Event::ChatText(second)) => {
            assert_eq!(first.content, "ephemeral");
            assert_eq!(second.content, "persistent");
        }
        other => panic!("expected two ChatText events, got {other:?}"),
    }
}
