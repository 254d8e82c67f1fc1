//! Versioned artifact storage.
//!
//! Artifacts are blobs addressed by `(app, user, session, filename)`. Every
//! save appends a new version; versions are contiguous `0..N-1` and a load
//! without an explicit version returns the most recent one. A filename
//! starting with `user:` is stored in a per-user namespace instead of the
//! session, so it survives across sessions of the same user.
//!
//! Two backends ship with the crate: [`InMemoryArtifactService`] for tests
//! and embedded use, and [`FileArtifactService`] which lays keys out on disk
//! the way an object store would:
//! `{app}/{user}/{session}/{filename}/{version}` (or `.../user/...` for
//! user-namespaced filenames).

use crate::agentflow::content::Part;
use crate::agentflow::error::{AgentError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Namespace segment substituted for the session when a filename carries the
/// `user:` prefix.
const USER_NAMESPACE: &str = "user";

/// Address of one artifact (all of its versions).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub app: String,
    pub user: String,
    pub session: String,
    pub filename: String,
}

impl ArtifactKey {
    pub fn new(
        app: impl Into<String>,
        user: impl Into<String>,
        session: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            session: session.into(),
            filename: filename.into(),
        }
    }

    /// True when the filename opts into the per-user namespace.
    pub fn is_user_namespaced(&self) -> bool {
        self.filename.starts_with("user:")
    }

    /// `{app}/{user}/{session|user}/{filename}`, the object-store prefix
    /// shared by all versions of this artifact.
    pub fn storage_prefix(&self) -> String {
        let scope = if self.is_user_namespaced() {
            USER_NAMESPACE
        } else {
            self.session.as_str()
        };
        format!("{}/{}/{}/{}", self.app, self.user, scope, self.filename)
    }
}

/// Versioned blob store shared by every backend.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    /// Append a new version; returns the zero-based version just written.
    /// Concurrent saves on one key never produce duplicate versions.
    async fn save_artifact(&self, key: &ArtifactKey, part: Part) -> Result<u64>;

    /// Load a version, or the latest when `version` is `None`. `Ok(None)`
    /// when the key or version does not exist.
    async fn load_artifact(&self, key: &ArtifactKey, version: Option<u64>) -> Result<Option<Part>>;

    /// Sorted filenames visible to `(app, user, session)`, including the
    /// user-namespaced ones.
    async fn list_artifact_keys(&self, app: &str, user: &str, session: &str)
        -> Result<Vec<String>>;

    /// Remove all versions of a key. Removing a missing key is a no-op.
    async fn delete_artifact(&self, key: &ArtifactKey) -> Result<()>;

    /// Stored versions in ascending order; empty when the key is missing.
    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u64>>;
}

/// Map-backed artifact store. Versions are the vector indices.
#[derive(Default)]
pub struct InMemoryArtifactService {
    entries: Mutex<HashMap<String, Vec<Part>>>,
}

impl InMemoryArtifactService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    async fn save_artifact(&self, key: &ArtifactKey, part: Part) -> Result<u64> {
        // Lock spans list-max-then-write, so versions stay contiguous under
        // concurrent saves.
        let mut entries = self.entries.lock().await;
        let versions = entries.entry(key.storage_prefix()).or_insert_with(Vec::new);
        versions.push(part);
        Ok((versions.len() - 1) as u64)
    }

    async fn load_artifact(&self, key: &ArtifactKey, version: Option<u64>) -> Result<Option<Part>> {
        let entries = self.entries.lock().await;
        let versions = match entries.get(&key.storage_prefix()) {
            Some(versions) => versions,
            None => return Ok(None),
        };
        let index = match version {
            Some(v) => v as usize,
            None => match versions.len().checked_sub(1) {
                Some(last) => last,
                None => return Ok(None),
            },
        };
        Ok(versions.get(index).cloned())
    }

    async fn list_artifact_keys(
        &self,
        app: &str,
        user: &str,
        session: &str,
    ) -> Result<Vec<String>> {
        let session_prefix = format!("{}/{}/{}/", app, user, session);
        let user_prefix = format!("{}/{}/{}/", app, user, USER_NAMESPACE);
        let entries = self.entries.lock().await;
        let mut names: Vec<String> = entries
            .keys()
            .filter_map(|stored| {
                stored
                    .strip_prefix(&session_prefix)
                    .or_else(|| stored.strip_prefix(&user_prefix))
                    .map(|name| name.to_string())
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn delete_artifact(&self, key: &ArtifactKey) -> Result<()> {
        self.entries.lock().await.remove(&key.storage_prefix());
        Ok(())
    }

    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u64>> {
        let entries = self.entries.lock().await;
        let count = entries
            .get(&key.storage_prefix())
            .map(|versions| versions.len())
            .unwrap_or(0);
        Ok((0..count as u64).collect())
    }
}

/// Filesystem-backed artifact store using the object-store key layout.
///
/// Each version is one JSON file `{root}/{prefix}/{version}`. Writes on the
/// same key serialize through a per-key lock so the list-max-then-write
/// section is exclusive.
pub struct FileArtifactService {
    root: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileArtifactService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, prefix: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(prefix.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn key_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.storage_prefix())
    }

    async fn stored_versions(dir: &PathBuf) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(versions),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(version) = name.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

#[async_trait]
impl ArtifactService for FileArtifactService {
    async fn save_artifact(&self, key: &ArtifactKey, part: Part) -> Result<u64> {
        let prefix = key.storage_prefix();
        let lock = self.lock_for(&prefix).await;
        let _guard = lock.lock().await;

        let dir = self.key_dir(key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        let versions = Self::stored_versions(&dir).await?;
        let next = versions.last().map(|v| v + 1).unwrap_or(0);
        let encoded =
            serde_json::to_vec(&part).map_err(|e| AgentError::Internal(e.to_string()))?;
        tokio::fs::write(dir.join(next.to_string()), encoded)
            .await
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        Ok(next)
    }

    async fn load_artifact(&self, key: &ArtifactKey, version: Option<u64>) -> Result<Option<Part>> {
        let dir = self.key_dir(key);
        let version = match version {
            Some(v) => v,
            None => match Self::stored_versions(&dir).await?.last().copied() {
                Some(latest) => latest,
                None => return Ok(None),
            },
        };
        let bytes = match tokio::fs::read(dir.join(version.to_string())).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        let part =
            serde_json::from_slice(&bytes).map_err(|e| AgentError::Internal(e.to_string()))?;
        Ok(Some(part))
    }

    async fn list_artifact_keys(
        &self,
        app: &str,
        user: &str,
        session: &str,
    ) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for scope in &[session, USER_NAMESPACE] {
            let dir = self.root.join(app).join(user).join(scope);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| AgentError::Internal(e.to_string()))?
            {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn delete_artifact(&self, key: &ArtifactKey) -> Result<()> {
        let prefix = key.storage_prefix();
        let lock = self.lock_for(&prefix).await;
        let _guard = lock.lock().await;
        match tokio::fs::remove_dir_all(self.key_dir(key)).await {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Internal(e.to_string())),
        }
    }

    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<u64>> {
        Self::stored_versions(&self.key_dir(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(filename: &str) -> ArtifactKey {
        ArtifactKey::new("app", "alice", "s1", filename)
    }

    #[test]
    fn test_user_namespace_replaces_session() {
        assert_eq!(key("notes.txt").storage_prefix(), "app/alice/s1/notes.txt");
        assert_eq!(
            key("user:prefs.json").storage_prefix(),
            "app/alice/user/user:prefs.json"
        );
    }

    #[tokio::test]
    async fn test_versions_are_contiguous_and_latest_wins() {
        let store = InMemoryArtifactService::new();
        let k = key("doc.txt");
        for i in 0..3 {
            let version = store
                .save_artifact(&k, Part::text(format!("v{}", i)))
                .await
                .unwrap();
            assert_eq!(version, i as u64);
        }
        assert_eq!(store.list_versions(&k).await.unwrap(), vec![0, 1, 2]);

        let latest = store.load_artifact(&k, None).await.unwrap().unwrap();
        assert_eq!(latest.as_text(), Some("v2"));
        let first = store.load_artifact(&k, Some(0)).await.unwrap().unwrap();
        assert_eq!(first.as_text(), Some("v0"));
    }

    #[tokio::test]
    async fn test_delete_removes_all_versions() {
        let store = InMemoryArtifactService::new();
        let k = key("doc.txt");
        store.save_artifact(&k, Part::text("a")).await.unwrap();
        store.save_artifact(&k, Part::text("b")).await.unwrap();
        store.delete_artifact(&k).await.unwrap();
        assert!(store.load_artifact(&k, None).await.unwrap().is_none());
        assert!(store.list_versions(&k).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_keys_is_sorted_and_spans_namespaces() {
        let store = InMemoryArtifactService::new();
        store
            .save_artifact(&key("zeta.txt"), Part::text("z"))
            .await
            .unwrap();
        store
            .save_artifact(&key("alpha.txt"), Part::text("a"))
            .await
            .unwrap();
        store
            .save_artifact(&key("user:prefs.json"), Part::text("p"))
            .await
            .unwrap();
        let names = store.list_artifact_keys("app", "alice", "s1").await.unwrap();
        assert_eq!(names, vec!["alpha.txt", "user:prefs.json", "zeta.txt"]);
    }

    #[tokio::test]
    async fn test_other_sessions_stay_invisible() {
        let store = InMemoryArtifactService::new();
        store
            .save_artifact(&ArtifactKey::new("app", "alice", "s1", "a.txt"), Part::text("a"))
            .await
            .unwrap();
        store
            .save_artifact(&ArtifactKey::new("app", "alice", "s2", "b.txt"), Part::text("b"))
            .await
            .unwrap();
        let names = store.list_artifact_keys("app", "alice", "s1").await.unwrap();
        assert_eq!(names, vec!["a.txt"]);
    }
}
