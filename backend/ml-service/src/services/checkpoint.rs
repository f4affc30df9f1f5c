// ============================================
// Checkpoint Store
// ============================================
//
// A checkpoint bundles weights, optimizer moments, loss history, node-index
// mappings and hyperparameters. Files are written to a temp path and renamed
// so readers never observe a half-written bundle.

use crate::config::{HgtConfig, LightGcnConfig, TgnConfig};
use crate::error::{AppError, Result};
use crate::models::{EngineKind, LoadStatus};
use crate::nn::{AdamState, ParamStore};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Hyperparameters {
    LightGcn(LightGcnConfig),
    Tgn(TgnConfig),
    Hgt(HgtConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub engine: EngineKind,
    pub hyperparameters: Hyperparameters,
    /// Node type name -> ids in index order
    pub node_mappings: BTreeMap<String, Vec<String>>,
    pub params: ParamStore,
    pub optimizer: AdamState,
    pub train_losses: Vec<f32>,
    /// Non-trainable state such as recurrent memory
    pub buffers: BTreeMap<String, Array2<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Checks that this bundle can replace a model built from `hyperparameters`
    /// over a graph with `node_mappings`. Parameter shapes are checked by the
    /// caller against its own store.
    pub fn verify(
        &self,
        engine: EngineKind,
        hyperparameters: &Hyperparameters,
        node_mappings: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        if self.engine != engine {
            return Err(AppError::Checkpoint(format!(
                "checkpoint is for {}, expected {}",
                self.engine.as_str(),
                engine.as_str()
            )));
        }
        if &self.hyperparameters != hyperparameters {
            return Err(AppError::ShapeMismatch(
                "hyperparameters differ from current configuration".to_string(),
            ));
        }
        if &self.node_mappings != node_mappings {
            let describe = |m: &BTreeMap<String, Vec<String>>| {
                m.iter()
                    .map(|(k, v)| format!("{k}={}", v.len()))
                    .collect::<Vec<_>>()
                    .join(",")
            };
            return Err(AppError::ShapeMismatch(format!(
                "node mappings differ (checkpoint {}, graph {})",
                describe(&self.node_mappings),
                describe(node_mappings)
            )));
        }
        Ok(())
    }
}

/// Upgrades an older bundle to the current format. Every format change must
/// add an explicit step here.
fn migrate(checkpoint: Checkpoint) -> Result<Checkpoint> {
    match checkpoint.format_version {
        FORMAT_VERSION => Ok(checkpoint),
        other => Err(AppError::Checkpoint(format!(
            "no migration from checkpoint format {other} to {FORMAT_VERSION}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, engine: EngineKind) -> PathBuf {
        self.dir.join(engine.checkpoint_file())
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(checkpoint.engine);
        let tmp = path.with_extension("ckpt.tmp");

        let bytes = bincode::serialize(checkpoint)?;
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;

        info!(
            engine = checkpoint.engine.as_str(),
            path = %path.display(),
            bytes = bytes.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// `Ok(None)` when no checkpoint exists; `Err` for unreadable content.
    pub fn load(&self, engine: EngineKind) -> Result<Option<Checkpoint>> {
        let path = self.path(engine);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let checkpoint: Checkpoint = bincode::deserialize(&bytes)?;
        migrate(checkpoint).map(Some)
    }
}

/// Fetches and applies a checkpoint through `apply`, folding every failure
/// into a [`LoadStatus`]. `apply` must leave the target untouched on error.
pub fn load_into<F>(store: &CheckpointStore, engine: EngineKind, apply: F) -> LoadStatus
where
    F: FnOnce(Checkpoint) -> Result<()>,
{
    let checkpoint = match store.load(engine) {
        Ok(Some(checkpoint)) => checkpoint,
        Ok(None) => return LoadStatus::NoSavedModel,
        Err(err) => {
            warn!(engine = engine.as_str(), error = %err, "Checkpoint unreadable");
            return LoadStatus::Rejected(err.to_string());
        }
    };

    match apply(checkpoint) {
        Ok(()) => {
            info!(engine = engine.as_str(), "Checkpoint loaded");
            LoadStatus::Loaded
        }
        Err(err) => {
            warn!(engine = engine.as_str(), error = %err, "Checkpoint rejected");
            LoadStatus::Rejected(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut params = ParamStore::default();
        params.add("w", Array2::from_elem((2, 2), 0.5));
        let mut mappings = BTreeMap::new();
        mappings.insert("user".to_string(), vec!["u1".to_string()]);
        Checkpoint {
            format_version: FORMAT_VERSION,
            engine: EngineKind::LightGcn,
            hyperparameters: Hyperparameters::LightGcn(LightGcnConfig::default()),
            node_mappings: mappings,
            params,
            optimizer: AdamState::default(),
            train_losses: vec![0.7, 0.5],
            buffers: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let ckpt = sample();
        store.save(&ckpt).unwrap();

        let loaded = store.load(EngineKind::LightGcn).unwrap().unwrap();
        assert_eq!(loaded.params, ckpt.params);
        assert_eq!(loaded.train_losses, ckpt.train_losses);
        assert!(store.load(EngineKind::Hgt).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(store.path(EngineKind::Tgn), b"not a checkpoint").unwrap();

        let status = load_into(&store, EngineKind::Tgn, |_| Ok(()));
        assert!(matches!(status, LoadStatus::Rejected(_)));
    }

    #[test]
    fn test_missing_file_reports_no_saved_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("nested"));
        let status = load_into(&store, EngineKind::Hgt, |_| Ok(()));
        assert_eq!(status, LoadStatus::NoSavedModel);
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let ckpt = sample();
        let hyper = Hyperparameters::LightGcn(LightGcnConfig::default());

        assert!(ckpt.verify(EngineKind::LightGcn, &hyper, &ckpt.node_mappings).is_ok());
        assert!(ckpt.verify(EngineKind::Hgt, &hyper, &ckpt.node_mappings).is_err());

        let mut other = ckpt.node_mappings.clone();
        other.insert("user".to_string(), vec!["u1".to_string(), "u2".to_string()]);
        assert!(matches!(
            ckpt.verify(EngineKind::LightGcn, &hyper, &other),
            Err(AppError::ShapeMismatch(_))
        ));

        let changed = Hyperparameters::LightGcn(LightGcnConfig {
            num_layers: 5,
            ..LightGcnConfig::default()
        });
        assert!(ckpt.verify(EngineKind::LightGcn, &changed, &ckpt.node_mappings).is_err());
    }

    #[test]
    fn test_unknown_format_version_rejected() {
        let mut ckpt = sample();
        ckpt.format_version = 0;
        assert!(migrate(ckpt).is_err());
    }
}
