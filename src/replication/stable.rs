use crate::error::RaftError;
use crate::replication::ClusterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Durable per-node consensus state. Term and vote must hit disk
/// before any vote or append response leaves the node; `last_applied`
/// keeps restarts from re-applying entries the state machine already
/// holds durably.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub last_applied: u64,
    pub members: ClusterConfig,
}

/// JSON-on-disk key/value document for cluster configuration and vote
/// metadata, rewritten atomically via a sibling temp file.
#[derive(Debug)]
pub struct StableStore {
    path: PathBuf,
}

impl StableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RaftError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<HardState, RaftError> {
        if !self.path.exists() {
            return Ok(HardState::default());
        }
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn store(&self, state: &HardState) -> Result<(), RaftError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_default() {
        let tmp = TempDir::new().unwrap();
        let store = StableStore::open(tmp.path().join("stable.json")).unwrap();
        assert!(!store.exists());
        assert_eq!(store.load().unwrap(), HardState::default());
    }

    #[test]
    fn round_trips_state() {
        let tmp = TempDir::new().unwrap();
        let store = StableStore::open(tmp.path().join("stable.json")).unwrap();
        let state = HardState {
            current_term: 3,
            voted_for: Some("node-b".into()),
            last_applied: 12,
            members: ClusterConfig::single("node-a", "127.0.0.1:9000"),
        };
        store.store(&state).unwrap();
        assert!(store.exists());
        assert_eq!(store.load().unwrap(), state);
    }
}
