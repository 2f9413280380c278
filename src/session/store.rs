//! Checkpoint Store (C1) — durable, atomic per-session snapshots.
//!
//! Grounded on the teacher's `orchestrator/session.rs` (`SessionManager`
//! save/load/clear shape) and `memory/history.rs` (advisory-lock + atomic
//! write discipline via `tokio::task::spawn_blocking`). Writes go to a
//! sibling temp file, are `fsync`'d, then renamed over the target so
//! readers never observe a partial write (I7, spec §4.1/§6.1).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs as tokio_fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::session::Session;

/// Number of lock stripes. Two different `session_id`s may hash to the
/// same stripe; that only adds spurious serialization, never incorrect
/// concurrency, so a small fixed table is sufficient (spec §4.1, §5).
const STRIPES: usize = 64;

fn is_safe_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && !session_id.contains('/')
        && !session_id.contains('\\')
        && session_id != "."
        && session_id != ".."
}

/// Per-session exclusive lock table, keyed by a hash of `session_id` into a
/// fixed number of stripes (I8).
pub struct CheckpointStore {
    base_dir: PathBuf,
    stripes: Vec<Arc<Mutex<()>>>,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let stripes = (0..STRIPES).map(|_| Arc::new(Mutex::new(()))).collect();
        Self {
            base_dir: base_dir.into(),
            stripes,
        }
    }

    fn stripe_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[idx].clone()
    }

    /// Acquire the per-session lock for the duration of a load-modify-save
    /// cycle. Callers hold the returned guard across the whole turn.
    pub async fn lock(&self, session_id: &str) -> EngineResult<tokio::sync::OwnedMutexGuard<()>> {
        if !is_safe_session_id(session_id) {
            return Err(EngineError::ValidationError(format!(
                "invalid session id: {session_id}"
            )));
        }
        Ok(self.stripe_for(session_id).lock_owned().await)
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.json"))
    }

    fn tmp_path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.json.tmp"))
    }

    pub async fn save(&self, session: &Session) -> EngineResult<PathBuf> {
        if !is_safe_session_id(&session.session_id) {
            return Err(EngineError::ValidationError(format!(
                "invalid session id: {}",
                session.session_id
            )));
        }
        tokio_fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| EngineError::ConfigError(format!("cannot create checkpoint dir: {e}")))?;

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| EngineError::ValidationError(format!("session not serializable: {e}")))?;

        let final_path = self.path_for(&session.session_id);
        let tmp_path = self.tmp_path_for(&session.session_id);

        write_atomic(&tmp_path, &final_path, &json)
            .await
            .map_err(|e| EngineError::ConfigError(format!("checkpoint write failed: {e}")))?;

        debug!(session_id = %session.session_id, path = %final_path.display(), "checkpoint saved");
        Ok(final_path)
    }

    /// Missing file returns `Ok(None)`; a malformed file fails loudly
    /// (`StateCorruption`) rather than silently resetting (spec §4.1, §7).
    pub async fn load(&self, session_id: &str) -> EngineResult<Option<Session>> {
        if !is_safe_session_id(session_id) {
            return Err(EngineError::ValidationError(format!(
                "invalid session id: {session_id}"
            )));
        }
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio_fs::read(&path)
            .await
            .map_err(|e| EngineError::ConfigError(format!("checkpoint read failed: {e}")))?;
        let session: Session = serde_json::from_slice(&bytes)
            .map_err(|_| EngineError::StateCorruption(session_id.to_string()))?;
        Ok(Some(session))
    }

    pub async fn delete(&self, session_id: &str) -> EngineResult<()> {
        if !is_safe_session_id(session_id) {
            return Err(EngineError::ValidationError(format!(
                "invalid session id: {session_id}"
            )));
        }
        let path = self.path_for(session_id);
        if path.exists() {
            tokio_fs::remove_file(&path)
                .await
                .map_err(|e| EngineError::ConfigError(format!("checkpoint delete failed: {e}")))?;
        }
        Ok(())
    }
}

async fn write_atomic(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = tmp_path.to_path_buf();
    let final_path = final_path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::fs::File;
        use std::io::Write;

        let mut file = File::create(&tmp_path)?;
        #[cfg(unix)]
        {
            use fs2::FileExt;
            // The in-process stripe lock (I8) already serializes same-process
            // writers; this advisory lock additionally protects against a
            // second engine process racing the same checkpoint file.
            file.lock_exclusive()?;
        }
        file.write_all(&bytes)?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use fs2::FileExt;
            fs2::FileExt::unlock(&file)?;
        }
        drop(file);
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(format!("checkpoint write task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let session = Session::new("sess-1", "I1", "C1", None);

        let path = store.save(&session).await.unwrap();
        assert!(path.exists());

        let loaded = store.load("sess-1").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "sess-1");
        assert_eq!(loaded.interview_id, "I1");
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("does-not-exist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_malformed_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        tokio_fs::create_dir_all(dir.path()).await.unwrap();
        tokio_fs::write(dir.path().join("broken.json"), b"not json")
            .await
            .unwrap();

        let err = store.load("broken").await.unwrap_err();
        assert!(matches!(err, EngineError::StateCorruption(_)));
    }

    #[tokio::test]
    async fn delete_removes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let session = Session::new("sess-2", "I1", "C1", None);
        store.save(&session).await.unwrap();
        store.delete("sess-2").await.unwrap();
        assert!(store.load("sess-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let err = store.load("../escape").await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationError(_)));
    }
}
