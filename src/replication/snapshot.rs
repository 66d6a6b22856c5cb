use crate::error::RaftError;
use crate::replication::ClusterConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Metadata persisted beside each snapshot payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: u64,
    pub last_term: u64,
    pub members: ClusterConfig,
}

/// File-backed snapshot store: `<term>-<index>.snap` payloads with a
/// sibling `.meta` JSON document. Only the newest snapshot is
/// retained.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RaftError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persists a snapshot by streaming `data` into a temp file and
    /// renaming it into place, then drops older snapshots.
    pub fn create(
        &self,
        meta: &SnapshotMeta,
        data: &mut dyn Read,
    ) -> Result<(), RaftError> {
        let stem = format!("{}-{}", meta.last_term, meta.last_index);
        let snap_path = self.dir.join(format!("{stem}.snap"));
        let tmp_path = self.dir.join(format!("{stem}.tmp"));
        {
            let mut file = File::create(&tmp_path)?;
            io::copy(data, &mut file)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &snap_path)?;
        fs::write(
            self.dir.join(format!("{stem}.meta")),
            serde_json::to_vec_pretty(meta)?,
        )?;
        info!(
            "event=snapshot_persist dir={:?} index={} term={}",
            self.dir, meta.last_index, meta.last_term
        );
        self.retain(&stem)?;
        Ok(())
    }

    /// Newest snapshot by (term, index), if any.
    pub fn latest(&self) -> Result<Option<SnapshotMeta>, RaftError> {
        let mut newest: Option<SnapshotMeta> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "meta") {
                continue;
            }
            let meta: SnapshotMeta = serde_json::from_slice(&fs::read(&path)?)?;
            let newer = newest.as_ref().map_or(true, |current| {
                (meta.last_term, meta.last_index) > (current.last_term, current.last_index)
            });
            if newer {
                newest = Some(meta);
            }
        }
        Ok(newest)
    }

    pub fn open_data(&self, meta: &SnapshotMeta) -> Result<File, RaftError> {
        let path = self
            .dir
            .join(format!("{}-{}.snap", meta.last_term, meta.last_index));
        Ok(File::open(path)?)
    }

    pub fn is_empty(&self) -> Result<bool, RaftError> {
        Ok(self.latest()?.is_none())
    }

    fn retain(&self, keep_stem: &str) -> Result<(), RaftError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if stem != keep_stem {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
