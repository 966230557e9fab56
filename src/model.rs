//! Data model entities shared across transport, offsets, and the connection
//! state machine.

use serde::{Deserialize, Serialize};

/// Poll source hint sent on every pull; serialized as the upper-case strings
/// the server expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollSource {
    #[default]
    Auto,
    Cache,
    Kafka,
}

impl Serialize for PollSource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            PollSource::Auto => "AUTO",
            PollSource::Cache => "CACHE",
            PollSource::Kafka => "KAFKA",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for PollSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.to_ascii_uppercase().as_str() {
            "CACHE" => PollSource::Cache,
            "KAFKA" => PollSource::Kafka,
            _ => PollSource::Auto,
        })
    }
}

/// Credentials identifying a channel. `channel_secret`, once derived, MUST
/// equal `deriveChannelSecret(channel_name, channel_password)`.
#[derive(Debug, Clone, Default)]
pub struct ChannelCredentials {
    pub channel_name: Option<String>,
    pub channel_password: Option<String>,
    pub channel_secret: Option<String>,
}

/// Server-issued session handle, persisted across reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub connection_time: f64,
    pub channel_id: String,
}

/// Channel metadata returned by the server on connect; offsets advance via
/// pulls but the rest is read-only on the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    #[serde(default)]
    pub topic_name: Option<String>,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub global_offset: i64,
    #[serde(default)]
    pub local_offset: i64,
    #[serde(default)]
    pub original_global_offset: i64,
    #[serde(default)]
    pub original_local_offset: Option<i64>,
}

/// Input to every pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveConfig {
    pub global_offset: i64,
    pub local_offset: i64,
    pub limit: i64,
    pub poll_source: PollSource,
}

/// A participant currently on the channel, as returned by `/list-agents`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default, rename = "agentName")]
    pub agent_name: String,
    #[serde(default, rename = "connectionTime")]
    pub connection_time: Option<f64>,
}

impl ReceiveConfig {
    pub const DEFAULT_LIMIT: i64 = 20;

    pub fn new(global_offset: i64, local_offset: i64) -> Self {
        Self {
            global_offset,
            local_offset,
            limit: Self::DEFAULT_LIMIT,
            poll_source: PollSource::Auto,
        }
    }
}
