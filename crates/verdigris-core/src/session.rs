//! Session-store boundary.
//!
//! The engine only needs three operations from the session layer: patch a
//! session's model settings, delete a session, and list the sessions that are
//! currently live. `FileSessionStore` is the default disk-backed
//! implementation, one JSON metadata file per session key.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::gateway::ThinkLevel;

/// The only fields a spawn may patch into a child session. Tool overrides
/// have no representation here, so they can never leak into session state.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Outer None leaves the level untouched; inner None clears it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<Option<ThinkLevel>>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.thinking_level.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: String,
    pub updated_at_ms: i64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Apply a patch, creating the session record if absent.
    async fn patch_session(&self, key: &str, patch: SessionPatch) -> Result<()>;

    async fn delete_session(&self, key: &str) -> Result<()>;

    async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>>;
}

/// Per-session metadata persisted by [`FileSessionStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking_level: Option<ThinkLevel>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

/// Disk-backed session store: `{dir}/{safe_key}.json` per session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Failed to create sessions dir {}: {e}", dir.display());
        }
        Self { dir }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        // : is not filesystem-safe on every platform
        let safe_key = key.replace(':', "_");
        self.dir.join(format!("{safe_key}.json"))
    }

    fn load(&self, key: &str) -> Option<SessionRecord> {
        let path = self.session_path(key);
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Read back a session's patched model (inspection and tests).
    pub fn model_of(&self, key: &str) -> Option<String> {
        self.load(key).and_then(|r| r.model)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn patch_session(&self, key: &str, patch: SessionPatch) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut record = self.load(key).unwrap_or(SessionRecord {
            key: key.to_string(),
            model: None,
            thinking_level: None,
            created_at_ms: now,
            updated_at_ms: now,
        });
        if let Some(model) = patch.model {
            record.model = Some(model);
        }
        if let Some(level) = patch.thinking_level {
            record.thinking_level = level;
        }
        record.updated_at_ms = now;

        let path = self.session_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }

    async fn delete_session(&self, key: &str) -> Result<()> {
        let path = self.session_path(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Ok(sessions),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<SessionRecord>(&contents) else {
                continue;
            };
            sessions.push(SessionInfo {
                key: record.key,
                updated_at_ms: record.updated_at_ms,
            });
        }
        sessions.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (FileSessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FileSessionStore::new(dir.path().to_path_buf()), dir)
    }

    #[tokio::test]
    async fn patch_creates_and_updates() {
        let (store, _dir) = store();
        store
            .patch_session(
                "agent:main:subagent:x",
                SessionPatch {
                    model: Some("anthropic/sonnet".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.model_of("agent:main:subagent:x").as_deref(),
            Some("anthropic/sonnet")
        );

        store
            .patch_session(
                "agent:main:subagent:x",
                SessionPatch {
                    thinking_level: Some(Some(ThinkLevel::High)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // model survives an unrelated patch
        assert_eq!(
            store.model_of("agent:main:subagent:x").as_deref(),
            Some("anthropic/sonnet")
        );
    }

    #[tokio::test]
    async fn delete_then_list() {
        let (store, _dir) = store();
        store
            .patch_session("agent:main:main", SessionPatch::default())
            .await
            .unwrap();
        store
            .patch_session("agent:main:subagent:y", SessionPatch::default())
            .await
            .unwrap();

        let keys: Vec<_> = store
            .list_active_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"agent:main:main".to_string()));

        store.delete_session("agent:main:subagent:y").await.unwrap();
        let keys = store.list_active_sessions().await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn patch_serialization_never_contains_tool_keys() {
        let patch = SessionPatch {
            model: Some("m1".into()),
            thinking_level: Some(None),
        };
        let json = serde_json::to_value(&patch).unwrap();
        let obj = json.as_object().unwrap();
        for forbidden in ["toolOverrides", "allow", "deny"] {
            assert!(!obj.contains_key(forbidden));
        }
    }
}
