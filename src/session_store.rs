//! Session recovery storage, kept behind a trait (spec DESIGN NOTES §9) so
//! production code can use the filesystem while tests inject an in-memory
//! store instead of touching `~/.agent_sessions/`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Abstraction over "remember the last session id for a channel key."
pub trait SessionStore: Send + Sync {
    fn load(&self, channel_key: &str) -> Option<String>;
    fn save(&self, channel_key: &str, session_id: &str);
}

/// Sanitizes a channel key for use as a filename (slashes replaced, per
/// `original_source/.../util/session_recovery_utility.py`).
fn sanitize(channel_key: &str) -> String {
    channel_key.replace(['/', '\\'], "_")
}

/// One JSON file per channel under `~/.agent_sessions/`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new() -> Self {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent_sessions");
        Self { dir }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, channel_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(channel_key)))
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, channel_key: &str) -> Option<String> {
        let content = fs::read_to_string(self.path_for(channel_key)).ok()?;
        let stored: StoredSession = serde_json::from_str(&content).ok()?;
        Some(stored.session_id)
    }

    fn save(&self, channel_key: &str, session_id: &str) {
        if fs::create_dir_all(&self.dir).is_err() {
            log::warn!("could not create session recovery directory {:?}", self.dir);
            return;
        }
        let stored = StoredSession {
            session_id: session_id.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&stored) {
            if let Err(e) = fs::write(self.path_for(channel_key), json) {
                log::warn!("could not persist session for {channel_key}: {e}");
            }
        }
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, channel_key: &str) -> Option<String> {
        self.sessions.lock().unwrap().get(channel_key).cloned()
    }

    fn save(&self, channel_key: &str, session_id: &str) {
        self.sessions
            .lock()
            .unwrap()
            .insert(channel_key.to_string(), session_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemorySessionStore::new();
        assert_eq!(store.load("chan"), None);
        store.save("chan", "S1");
        assert_eq!(store.load("chan"), Some("S1".to_string()));
    }

    #[test]
    fn file_store_round_trips_and_sanitizes_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSessionStore::with_dir(tmp.path());
        store.save("org/channel-a", "S42");
        assert_eq!(store.load("org/channel-a"), Some("S42".to_string()));
        assert!(tmp.path().join("org_channel-a.json").exists());
    }

    #[test]
    fn file_store_missing_file_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileSessionStore::with_dir(tmp.path());
        assert_eq!(store.load("never-saved"), None);
    }
}
