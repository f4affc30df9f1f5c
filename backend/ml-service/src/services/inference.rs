// ============================================
// Shared inference plumbing
// ============================================
//
// Embedding caches and scoring helpers used by all three engines.

use crate::error::{AppError, Result};
use crate::models::ScoredItem;
use crate::services::graph::NodeIndex;
use crate::utils::{cosine_similarity, row_norms, top_k};
use ndarray::{Array2, ArrayView1, Axis};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// User and item embedding tables produced by a full forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTables {
    pub users: Array2<f32>,
    pub items: Array2<f32>,
}

impl EmbeddingTables {
    pub fn ensure_finite(&self) -> Result<()> {
        if self.users.iter().chain(self.items.iter()).all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(AppError::NumericalInstability(
                "forward pass produced non-finite embeddings".to_string(),
            ))
        }
    }
}

#[derive(Debug)]
enum CacheState<T> {
    Empty,
    Ready(Arc<T>),
    Failed(String),
}

/// Lazily computed embeddings.
///
/// The first lookup computes implicitly. After a failed computation,
/// lookups report `NotComputed` until `refresh` succeeds.
#[derive(Debug)]
pub struct EmbeddingCache<T> {
    state: RwLock<CacheState<T>>,
}

impl<T> Default for EmbeddingCache<T> {
    fn default() -> Self {
        Self {
            state: RwLock::new(CacheState::Empty),
        }
    }
}

impl<T> EmbeddingCache<T> {
    pub fn refresh<F>(&self, compute: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut state = self.state.write();
        match compute() {
            Ok(value) => {
                let value = Arc::new(value);
                *state = CacheState::Ready(value.clone());
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "Embedding computation failed");
                *state = CacheState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    pub fn get_or_compute<F>(&self, compute: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        {
            let state = self.state.read();
            match &*state {
                CacheState::Ready(value) => return Ok(value.clone()),
                CacheState::Failed(reason) => return Err(AppError::NotComputed(reason.clone())),
                CacheState::Empty => {}
            }
        }
        self.refresh(compute)
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.read(), CacheState::Ready(_))
    }
}

/// Map string ids to indices, ignoring ids the index does not know.
pub fn resolve_exclusions(index: &NodeIndex, exclude: &HashSet<String>) -> HashSet<usize> {
    exclude.iter().filter_map(|id| index.get(id)).collect()
}

pub fn to_scored(index: &NodeIndex, ranked: Vec<(usize, f32)>) -> Vec<ScoredItem> {
    ranked
        .into_iter()
        .filter_map(|(idx, score)| {
            Some(ScoredItem {
                id: index.id(idx)?.to_string(),
                score,
            })
        })
        .collect()
}

/// Dot-product ranking of every candidate row against `query`.
pub fn rank_by_dot<F>(
    query: ArrayView1<f32>,
    candidates: &Array2<f32>,
    k: usize,
    exclude: &HashSet<usize>,
    filter: F,
) -> Vec<(usize, f32)>
where
    F: Fn(usize) -> bool,
{
    let scores: Vec<f32> = candidates.dot(&query).to_vec();
    top_k(&scores, k, exclude, filter)
}

/// Popularity proxy: candidates ranked by embedding norm.
pub fn rank_by_norm<F>(
    candidates: &Array2<f32>,
    k: usize,
    exclude: &HashSet<usize>,
    filter: F,
) -> Vec<(usize, f32)>
where
    F: Fn(usize) -> bool,
{
    top_k(&row_norms(candidates), k, exclude, filter)
}

/// Cosine ranking against candidate `anchor`, which is always excluded.
pub fn rank_by_cosine(candidates: &Array2<f32>, anchor: usize, k: usize) -> Vec<(usize, f32)> {
    let query = candidates.row(anchor);
    let scores: Vec<f32> = candidates
        .axis_iter(Axis(0))
        .map(|row| cosine_similarity(query, row))
        .collect();
    let exclude: HashSet<usize> = [anchor].into_iter().collect();
    top_k(&scores, k, &exclude, |_| true)
}
