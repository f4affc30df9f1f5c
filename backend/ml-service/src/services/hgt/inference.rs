// ============================================
// HGT Inference
// ============================================

use super::Hgt;
use crate::error::{AppError, Result};
use crate::models::ScoredItem;
use crate::services::graph::hetero::GraphStats;
use crate::services::graph::{HeteroGraph, NodeIndex, NodeType};
use crate::services::inference::{
    rank_by_cosine, rank_by_dot, rank_by_norm, resolve_exclusions, to_scored, EmbeddingCache,
    EmbeddingTables,
};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Final embeddings of every node type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEmbeddings {
    pub by_type: BTreeMap<NodeType, Array2<f32>>,
    pub dim: usize,
}

impl TypedEmbeddings {
    pub fn get(&self, node_type: NodeType) -> Option<&Array2<f32>> {
        self.by_type.get(&node_type)
    }

    /// User and game tables for the vector store.
    pub fn tables(&self) -> EmbeddingTables {
        let table = |nt| {
            self.get(nt)
                .cloned()
                .unwrap_or_else(|| Array2::zeros((0, self.dim)))
        };
        EmbeddingTables {
            users: table(NodeType::User),
            items: table(NodeType::Game),
        }
    }

    fn ensure_finite(&self) -> Result<()> {
        if self.by_type.values().all(|t| t.iter().all(|v| v.is_finite())) {
            Ok(())
        } else {
            Err(AppError::NumericalInstability(
                "HGT forward pass produced non-finite embeddings".to_string(),
            ))
        }
    }
}

/// Optional restriction of recommendation candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameFilter {
    pub provider: Option<String>,
    pub badge: Option<String>,
}

impl GameFilter {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.badge.is_none()
    }

    /// Game indices passing every constraint; `None` when unconstrained.
    pub fn allowed(&self, graph: &HeteroGraph) -> Option<HashSet<usize>> {
        if self.is_empty() {
            return None;
        }
        let mut allowed: Option<HashSet<usize>> = None;
        let constraints = [
            self.provider.as_deref().map(|p| graph.provider_games(p)),
            self.badge.as_deref().map(|b| graph.badge_games(b)),
        ];
        for games in constraints.into_iter().flatten() {
            let games: HashSet<usize> = games.into_iter().collect();
            allowed = Some(match allowed {
                Some(current) => current.intersection(&games).copied().collect(),
                None => games,
            });
        }
        allowed
    }
}

pub struct HgtInference {
    model: Hgt,
    graph: HeteroGraph,
    cache: EmbeddingCache<TypedEmbeddings>,
}

impl HgtInference {
    pub fn new(model: Hgt, graph: HeteroGraph) -> Self {
        Self {
            model,
            graph,
            cache: EmbeddingCache::default(),
        }
    }

    pub fn graph(&self) -> &HeteroGraph {
        &self.graph
    }

    pub fn graph_stats(&self) -> GraphStats {
        self.graph.stats()
    }

    fn full_pass(&self) -> Result<TypedEmbeddings> {
        let embeddings = TypedEmbeddings {
            by_type: self.model.embeddings(),
            dim: self.model.config().embedding_dim,
        };
        embeddings.ensure_finite()?;
        Ok(embeddings)
    }

    pub fn compute_embeddings(&self) -> Result<Arc<TypedEmbeddings>> {
        self.cache.refresh(|| self.full_pass())
    }

    pub fn embeddings(&self) -> Result<Arc<TypedEmbeddings>> {
        self.cache.get_or_compute(|| self.full_pass())
    }

    fn games_index(&self) -> NodeIndex {
        self.graph.index(NodeType::Game).cloned().unwrap_or_default()
    }

    pub fn node_embedding(&self, node_type: NodeType, id: &str) -> Result<Option<Array1<f32>>> {
        let embeddings = self.embeddings()?;
        Ok(self
            .graph
            .lookup(node_type, id)
            .and_then(|idx| Some(embeddings.get(node_type)?.row(idx).to_owned())))
    }

    pub fn get_recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
        filter: &GameFilter,
    ) -> Result<Vec<ScoredItem>> {
        self.rank_games(Some(user_id), top_k, exclude, filter)
    }

    fn rank_games(
        &self,
        user_id: Option<&str>,
        top_k: usize,
        exclude: &HashSet<String>,
        filter: &GameFilter,
    ) -> Result<Vec<ScoredItem>> {
        let embeddings = self.embeddings()?;
        let Some(games) = embeddings.get(NodeType::Game) else {
            return Ok(Vec::new());
        };
        let index = self.games_index();
        let excluded = resolve_exclusions(&index, exclude);
        let allowed = filter.allowed(&self.graph);
        let passes = |idx: usize| allowed.as_ref().map_or(true, |a| a.contains(&idx));

        let user = user_id
            .and_then(|id| self.graph.lookup(NodeType::User, id))
            .and_then(|idx| Some(embeddings.get(NodeType::User)?.row(idx)));
        let ranked = match user {
            Some(query) => rank_by_dot(query, games, top_k, &excluded, passes),
            None => {
                debug!(user_id = user_id.unwrap_or("-"), "No user embedding, ranking by norm");
                rank_by_norm(games, top_k, &excluded, passes)
            }
        };
        Ok(to_scored(&index, ranked))
    }

    pub fn similar_games(&self, game_id: &str, top_k: usize) -> Result<Vec<ScoredItem>> {
        let embeddings = self.embeddings()?;
        let idx = self
            .graph
            .lookup(NodeType::Game, game_id)
            .ok_or_else(|| AppError::NotFound(format!("game '{game_id}'")))?;
        let games = embeddings
            .get(NodeType::Game)
            .ok_or_else(|| AppError::NotFound(format!("game '{game_id}'")))?;
        Ok(to_scored(&self.games_index(), rank_by_cosine(games, idx, top_k)))
    }

    /// Games of a provider, personalized when the user is known and ranked
    /// by embedding norm otherwise. Unknown providers yield an empty list.
    pub fn provider_games(
        &self,
        provider_id: &str,
        user_id: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredItem>> {
        let filter = GameFilter {
            provider: Some(provider_id.to_string()),
            badge: None,
        };
        match self.graph.lookup(NodeType::Provider, provider_id) {
            Some(_) => self.rank_games(user_id, top_k, &HashSet::new(), &filter),
            None => Ok(Vec::new()),
        }
    }

    /// Embedding for a node outside the graph: the mean of its known
    /// connections of other types, or zeros when none are known.
    pub fn cold_start_embedding(
        &self,
        node_type: NodeType,
        connections: &[(NodeType, String)],
    ) -> Result<Array1<f32>> {
        let embeddings = self.embeddings()?;
        let mut sum = Array1::<f32>::zeros(embeddings.dim);
        let mut count = 0usize;
        for (nt, id) in connections {
            if *nt == node_type {
                continue;
            }
            let row = self
                .graph
                .lookup(*nt, id)
                .and_then(|idx| Some(embeddings.get(*nt)?.row(idx)));
            if let Some(row) = row {
                sum += &row;
                count += 1;
            }
        }
        if count > 0 {
            sum /= count as f32;
        }
        debug!(node_type = node_type.as_str(), known = count, "Cold-start embedding");
        Ok(sum)
    }
}
