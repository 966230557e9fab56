//! Environment / configuration layer.
//!
//! Recognized keys: `MESSAGING_API_URL`, `MESSAGING_API_KEY` (falling back to
//! `DEFAULT_API_KEY`), `MESSAGING_UDP_PORT`. Search order: a loaded `.env`
//! file, then the process environment, then built-in defaults.

use std::env;

const DEFAULT_API_URL: &str = "https://api.messaging-platform.example.com";
const DEFAULT_UDP_PORT: u16 = 9999;

/// Resolved runtime configuration for an [`crate::connection::AgentConnection`].
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub api_key: Option<String>,
    pub udp_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            udp_port: DEFAULT_UDP_PORT,
        }
    }
}

impl Config {
    /// Loads a `.env` file (if present) into the process environment, then
    /// resolves configuration from `MESSAGING_API_URL` / `MESSAGING_API_KEY`
    /// (or the legacy `DEFAULT_API_KEY`) / `MESSAGING_UDP_PORT`, falling back
    /// to built-in defaults for anything unset or invalid.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(url) = env::var("MESSAGING_API_URL") {
            if !url.is_empty() {
                config.api_url = url;
            }
        }

        if let Ok(key) = env::var("MESSAGING_API_KEY") {
            config.api_key = Some(key);
        } else if let Ok(key) = env::var("DEFAULT_API_KEY") {
            config.api_key = Some(key);
        }

        if let Ok(port_str) = env::var("MESSAGING_UDP_PORT") {
            // Out-of-range or unparseable values are ignored; the default stands.
            if let Ok(port) = port_str.parse::<u16>() {
                if port >= 1 {
                    config.udp_port = port;
                }
            }
        }

        config
    }

    /// Host portion of [`Config::api_url`], used to derive the UDP endpoint
    /// when the caller hasn't overridden it explicitly.
    pub fn api_host(&self) -> String {
        self.api_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split(['/', ':'])
            .next()
            .unwrap_or("")
            .to_string()
    }
}
