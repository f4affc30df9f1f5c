// ============================================
// LightGCN Inference
// ============================================

use super::LightGcn;
use crate::error::{AppError, Result};
use crate::models::ScoredItem;
use crate::services::graph::NodeIndex;
use crate::services::inference::{
    rank_by_cosine, rank_by_dot, rank_by_norm, resolve_exclusions, to_scored, EmbeddingCache,
    EmbeddingTables,
};
use ndarray::Array1;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Trained LightGCN model plus its cached embeddings.
pub struct LightGcnInference {
    model: LightGcn,
    users: NodeIndex,
    items: NodeIndex,
    cache: EmbeddingCache<EmbeddingTables>,
}

impl LightGcnInference {
    pub fn new(model: LightGcn, users: NodeIndex, items: NodeIndex) -> Self {
        Self {
            model,
            users,
            items,
            cache: EmbeddingCache::default(),
        }
    }

    pub fn users(&self) -> &NodeIndex {
        &self.users
    }

    pub fn items(&self) -> &NodeIndex {
        &self.items
    }

    /// Forces a fresh forward pass and caches the result.
    pub fn compute_embeddings(&self) -> Result<Arc<EmbeddingTables>> {
        self.cache.refresh(|| self.model.embeddings())
    }

    pub fn embeddings(&self) -> Result<Arc<EmbeddingTables>> {
        self.cache.get_or_compute(|| self.model.embeddings())
    }

    pub fn user_embedding(&self, user_id: &str) -> Result<Option<Array1<f32>>> {
        let tables = self.embeddings()?;
        Ok(self.users.get(user_id).map(|idx| tables.users.row(idx).to_owned()))
    }

    pub fn item_embedding(&self, item_id: &str) -> Result<Option<Array1<f32>>> {
        let tables = self.embeddings()?;
        Ok(self.items.get(item_id).map(|idx| tables.items.row(idx).to_owned()))
    }

    /// Dot-product recommendations; unknown users get the popularity
    /// ranking instead.
    pub fn get_recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<ScoredItem>> {
        let tables = self.embeddings()?;
        let excluded = resolve_exclusions(&self.items, exclude);

        let ranked = match self.users.get(user_id) {
            Some(idx) => rank_by_dot(tables.users.row(idx), &tables.items, top_k, &excluded, |_| true),
            None => {
                debug!(user_id, "Unknown user, using popularity fallback");
                rank_by_norm(&tables.items, top_k, &excluded, |_| true)
            }
        };
        Ok(to_scored(&self.items, ranked))
    }

    pub fn similar_games(&self, item_id: &str, top_k: usize) -> Result<Vec<ScoredItem>> {
        let tables = self.embeddings()?;
        let idx = self
            .items
            .get(item_id)
            .ok_or_else(|| AppError::NotFound(format!("game '{item_id}'")))?;
        Ok(to_scored(&self.items, rank_by_cosine(&tables.items, idx, top_k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LightGcnConfig;
    use crate::nn::seeded_rng;
    use crate::services::graph::bipartite::Interaction;
    use crate::services::graph::BipartiteGraph;

    fn inference() -> LightGcnInference {
        let users = NodeIndex::from_ids((0..3).map(|i| format!("u{i}")));
        let items = NodeIndex::from_ids((0..5).map(|i| format!("g{i}")));
        let graph = BipartiteGraph::new(
            users.clone(),
            items.clone(),
            vec![
                Interaction { user: 0, item: 0, weight: 1.0 },
                Interaction { user: 1, item: 1, weight: 2.0 },
                Interaction { user: 2, item: 2, weight: 1.0 },
                Interaction { user: 2, item: 3, weight: 1.0 },
            ],
        );
        let config = LightGcnConfig {
            embedding_dim: 6,
            num_layers: 2,
            ..LightGcnConfig::default()
        };
        let model = LightGcn::new(config, &graph, &mut seeded_rng(4));
        LightGcnInference::new(model, users, items)
    }

    #[test]
    fn test_lookup_triggers_implicit_compute() {
        let inf = inference();
        assert!(inf.user_embedding("u0").unwrap().is_some());
        assert!(inf.user_embedding("nobody").unwrap().is_none());
    }

    #[test]
    fn test_cold_start_user_gets_popularity() {
        let inf = inference();
        let recs = inf.get_recommendations("brand-new", 3, &HashSet::new()).unwrap();
        assert_eq!(recs.len(), 3);
        assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_exclusions_respected() {
        let inf = inference();
        let exclude: HashSet<String> = ["g0", "g1", "g2"].iter().map(|s| s.to_string()).collect();
        let recs = inf.get_recommendations("u0", 10, &exclude).unwrap();
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| !exclude.contains(&r.id)));
    }

    #[test]
    fn test_similar_games() {
        let inf = inference();
        let similar = inf.similar_games("g2", 10).unwrap();
        assert_eq!(similar.len(), 4);
        assert!(similar.iter().all(|s| s.id != "g2"));
        assert!(matches!(inf.similar_games("missing", 3), Err(AppError::NotFound(_))));
    }
}
