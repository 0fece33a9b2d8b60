use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tch::Tensor;

use repr_core::{tensor_io, ArchConfig};

use crate::error::{Result, TrainError};

const MAGIC: &[u8; 4] = b"RHCK";

/// Checkpoint address within a run. `Diverged` is the emergency tag
/// written right before a run aborts on a non-finite loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Latest,
    Best,
    Diverged,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Latest => "latest",
            Tag::Best => "best",
            Tag::Diverged => "diverged",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of improvement for the monitored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    pub fn improved(&self, new: f64, best: Option<f64>) -> bool {
        if new.is_nan() {
            return false;
        }
        match best {
            None => true,
            Some(best) => match self {
                MonitorMode::Min => new < best,
                MonitorMode::Max => new > best,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub run_id: String,
    pub tag: String,
    pub epoch: u64,
    pub global_step: u64,
    pub optim_step: u64,
    pub best_metric: Option<f64>,
    pub seed: u64,
    pub arch: ArchConfig,
    pub payload_sha256: String,
    pub created_unix: u64,
}

/// Deep CPU copies of everything a checkpoint persists, taken at the
/// moment of the call so a save never aliases live training state.
pub struct StateSnapshot {
    pub epoch: u64,
    pub global_step: u64,
    pub optim_step: u64,
    pub best_metric: Option<f64>,
    pub seed: u64,
    pub arch: ArchConfig,
    pub tensors: Vec<(String, Tensor)>,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub meta: CheckpointMeta,
    pub tensors: Vec<(String, Tensor)>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Persists and restores training state as one file per (run id, tag).
/// Writes go to a temp file first and are renamed into place, so a
/// concurrent reader sees either the old or the new checkpoint, never a
/// partial one.
pub struct CheckpointManager {
    dir: PathBuf,
    run_id: String,
    mode: MonitorMode,
    best: Option<f64>,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(dir: P, run_id: &str, mode: MonitorMode) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            run_id: run_id.to_string(),
            mode,
            best: None,
        })
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Used on resume to carry the recorded best value forward.
    pub fn set_best(&mut self, value: Option<f64>) {
        self.best = value;
    }

    fn path(&self, tag: Tag) -> PathBuf {
        self.dir.join(format!("{}.{}.ckpt", self.run_id, tag))
    }

    pub fn save(&self, snapshot: &StateSnapshot, tag: Tag) -> Result<()> {
        let payload = tensor_io::to_safetensors(&snapshot.tensors)?;
        let meta = CheckpointMeta {
            run_id: self.run_id.clone(),
            tag: tag.as_str().to_string(),
            epoch: snapshot.epoch,
            global_step: snapshot.global_step,
            optim_step: snapshot.optim_step,
            best_metric: snapshot.best_metric,
            seed: snapshot.seed,
            arch: snapshot.arch.clone(),
            payload_sha256: sha256_hex(&payload),
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let meta_bytes = serde_json::to_vec(&meta)?;

        let mut buf = Vec::with_capacity(8 + meta_bytes.len() + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(meta_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&meta_bytes);
        buf.extend_from_slice(&payload);

        let tmp = self.dir.join(format!(
            ".{}.{}.ckpt.tmp-{}",
            self.run_id,
            tag,
            std::process::id()
        ));
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, self.path(tag))?;
        log::info!(
            "saved checkpoint '{}' for run '{}' (epoch {}, step {})",
            tag,
            self.run_id,
            snapshot.epoch,
            snapshot.global_step
        );
        Ok(())
    }

    pub fn load(&self, tag: Tag) -> Result<LoadedCheckpoint> {
        let path = self.path(tag);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrainError::CheckpointNotFound {
                    run_id: self.run_id.clone(),
                    tag: tag.as_str().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        self.decode(tag, &bytes)
    }

    fn decode(&self, tag: Tag, bytes: &[u8]) -> Result<LoadedCheckpoint> {
        let corrupt = |reason: String| TrainError::CheckpointCorrupt {
            run_id: self.run_id.clone(),
            tag: tag.as_str().to_string(),
            reason,
        };
        if bytes.len() < 8 || &bytes[0..4] != MAGIC {
            return Err(corrupt("bad magic or truncated header".to_string()));
        }
        let meta_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if bytes.len() < 8 + meta_len {
            return Err(corrupt("truncated metadata".to_string()));
        }
        let meta: CheckpointMeta = serde_json::from_slice(&bytes[8..8 + meta_len])
            .map_err(|e| corrupt(format!("undecodable metadata: {}", e)))?;
        let payload = &bytes[8 + meta_len..];
        let digest = sha256_hex(payload);
        if digest != meta.payload_sha256 {
            return Err(corrupt("payload checksum mismatch".to_string()));
        }
        let tensors = tensor_io::from_safetensors(payload)
            .map_err(|e| corrupt(format!("undecodable payload: {}", e)))?;
        Ok(LoadedCheckpoint { meta, tensors })
    }

    /// Overwrite the `best` checkpoint if the monitored value improved.
    /// Returns whether it did.
    pub fn update_best(&mut self, snapshot: &StateSnapshot, value: f64) -> Result<bool> {
        if !self.mode.improved(value, self.best) {
            return Ok(false);
        }
        let snapshot = StateSnapshot {
            epoch: snapshot.epoch,
            global_step: snapshot.global_step,
            optim_step: snapshot.optim_step,
            best_metric: Some(value),
            seed: snapshot.seed,
            arch: snapshot.arch.clone(),
            tensors: snapshot
                .tensors
                .iter()
                .map(|(n, t)| (n.clone(), t.shallow_clone()))
                .collect(),
        };
        self.save(&snapshot, Tag::Best)?;
        self.best = Some(value);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn snapshot(epoch: u64) -> StateSnapshot {
        StateSnapshot {
            epoch,
            global_step: epoch * 10,
            optim_step: epoch * 10,
            best_metric: None,
            seed: 42,
            arch: ArchConfig::default(),
            tensors: vec![(
                "model/w".to_string(),
                Tensor::full(&[2, 2], epoch as i64, (Kind::Float, Device::Cpu)),
            )],
        }
    }

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(dir, "test-run", MonitorMode::Min).unwrap()
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.save(&snapshot(3), Tag::Latest).unwrap();
        let loaded = mgr.load(Tag::Latest).unwrap();
        assert_eq!(loaded.meta.epoch, 3);
        assert_eq!(loaded.meta.global_step, 30);
        assert_eq!(loaded.tensors.len(), 1);
        let value = loaded.tensors[0].1.double_value(&[0, 0]);
        assert!((value - 3.0).abs() < 1e-7);
    }

    #[test]
    fn save_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.save(&snapshot(1), Tag::Latest).unwrap();
        mgr.save(&snapshot(2), Tag::Latest).unwrap();
        let loaded = mgr.load(Tag::Latest).unwrap();
        assert_eq!(loaded.meta.epoch, 2);
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["test-run.latest.ckpt".to_string()]);
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr.load(Tag::Best).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointNotFound { .. }));
    }

    #[test]
    fn corrupting_one_payload_byte_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.save(&snapshot(1), Tag::Latest).unwrap();
        let path = dir.path().join("test-run.latest.ckpt");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        let err = mgr.load(Tag::Latest).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn concurrent_reads_see_only_complete_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.save(&snapshot(0), Tag::Latest).unwrap();

        std::thread::scope(|scope| {
            let path = dir.path().to_path_buf();
            let reader = scope.spawn(move || {
                let mgr = CheckpointManager::new(&path, "test-run", MonitorMode::Min).unwrap();
                for _ in 0..50 {
                    // Every visible checkpoint must decode fully, with the
                    // payload matching its own metadata.
                    let loaded = mgr.load(Tag::Latest).unwrap();
                    let value = loaded.tensors[0].1.double_value(&[0, 0]);
                    assert!(
                        (value - loaded.meta.epoch as f64).abs() < 1e-7,
                        "epoch {} paired with payload {}",
                        loaded.meta.epoch,
                        value
                    );
                }
            });
            for epoch in 1..=20 {
                mgr.save(&snapshot(epoch), Tag::Latest).unwrap();
            }
            reader.join().unwrap();
        });
    }

    #[test]
    fn best_tracks_the_extremum_under_min_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path());
        let values = [0.9, 0.7, 0.8, 0.4, 0.5];
        for (i, v) in values.iter().enumerate() {
            mgr.update_best(&snapshot(i as u64), *v).unwrap();
        }
        assert_eq!(mgr.best(), Some(0.4));
        let loaded = mgr.load(Tag::Best).unwrap();
        assert_eq!(loaded.meta.epoch, 3);
        assert_eq!(loaded.meta.best_metric, Some(0.4));
    }

    #[test]
    fn best_tracks_the_extremum_under_max_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = CheckpointManager::new(dir.path(), "acc-run", MonitorMode::Max).unwrap();
        for v in [0.1, 0.6, 0.3, 0.6] {
            mgr.update_best(&snapshot(0), v).unwrap();
        }
        assert_eq!(mgr.best(), Some(0.6));
    }
}
