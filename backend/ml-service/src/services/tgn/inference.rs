// ============================================
// TGN Inference
// ============================================

use super::memory::{MemoryState, MemoryStore};
use super::{neighbors_until, MemoryMessage, Neighbor, TgnModel};
use crate::error::{AppError, Result};
use crate::models::{EventCode, ScoredItem};
use crate::nn::Tape;
use crate::services::graph::NodeIndex;
use crate::services::inference::{
    rank_by_dot, rank_by_norm, resolve_exclusions, to_scored, EmbeddingCache, EmbeddingTables,
};
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// One entry of a user's recent-interaction ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub item: usize,
    pub timestamp: f64,
    pub weight: f32,
    pub event: EventCode,
}

/// Trained TGN model plus live per-user state.
///
/// Memory is looked up "as of" the request time, and the attention
/// context only includes interactions at or before it.
pub struct TgnInference {
    model: TgnModel,
    users: NodeIndex,
    items: NodeIndex,
    memory: MemoryStore,
    recent: HashMap<usize, VecDeque<HistoryEntry>>,
    capacity: usize,
    cache: EmbeddingCache<EmbeddingTables>,
}

impl TgnInference {
    pub fn new(model: TgnModel, users: NodeIndex, items: NodeIndex, baseline: MemoryState) -> Self {
        let capacity = (model.config().num_neighbors * 2).max(1);
        Self {
            memory: MemoryStore::new(baseline, capacity),
            model,
            users,
            items,
            recent: HashMap::new(),
            capacity,
            cache: EmbeddingCache::default(),
        }
    }

    pub fn model(&self) -> &TgnModel {
        &self.model
    }

    pub fn users(&self) -> &NodeIndex {
        &self.users
    }

    pub fn items(&self) -> &NodeIndex {
        &self.items
    }

    pub fn history_capacity(&self) -> usize {
        self.capacity
    }

    pub fn history(&self, user: usize) -> Vec<HistoryEntry> {
        self.recent
            .get(&user)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn live_users(&self) -> usize {
        self.memory.live_users()
    }

    /// Records an interaction: live memory update from the state as of
    /// `timestamp`, then the ring buffer append.
    pub fn observe(
        &mut self,
        user: usize,
        item: usize,
        event: EventCode,
        weight: f32,
        timestamp: f64,
    ) -> Result<()> {
        if user >= self.users.len() || item >= self.items.len() {
            return Err(AppError::NotFound(format!("node index {user}/{item}")));
        }

        let (row, last_update) = self.memory.state_at(user, timestamp);
        let mut tape = Tape::new();
        let memory = tape.constant(row.insert_axis(Axis(0)));
        let message = MemoryMessage {
            user,
            item,
            timestamp,
            event,
            weight,
        };
        let updated = self.model.update_memory(&mut tape, memory, &[message], &[last_update]);
        let updated = tape.value(updated).row(0).to_owned();
        if !updated.iter().all(|v| v.is_finite()) {
            return Err(AppError::NumericalInstability("memory update".to_string()));
        }
        self.memory.record(user, timestamp, updated);

        let ring = self.recent.entry(user).or_default();
        let pos = ring
            .iter()
            .position(|e| e.timestamp > timestamp)
            .unwrap_or(ring.len());
        ring.insert(
            pos,
            HistoryEntry {
                item,
                timestamp,
                weight,
                event,
            },
        );
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        debug!(user, item, timestamp, "TGN memory updated");
        Ok(())
    }

    /// Drops live memory and history for `user`.
    pub fn reset_user(&mut self, user: usize) {
        self.memory.reset(user);
        self.recent.remove(&user);
    }

    fn context(&self, user: usize, at: f64) -> Vec<Neighbor> {
        let history: Vec<Neighbor> = self
            .recent
            .get(&user)
            .map(|h| {
                h.iter()
                    .map(|e| Neighbor {
                        item: e.item,
                        timestamp: e.timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default();
        neighbors_until(&history, at, self.model.config().num_neighbors)
    }

    /// Contextual embedding of a user index as seen at time `at`.
    pub fn user_embedding_at(&self, user: usize, at: f64) -> Result<Array1<f32>> {
        if user >= self.users.len() {
            return Err(AppError::NotFound(format!("user index {user}")));
        }
        let (row, _) = self.memory.state_at(user, at);
        let mut tape = Tape::new();
        let memory = tape.constant(row.insert_axis(Axis(0)));
        let contexts = vec![self.context(user, at)];
        let out = self.model.embed_users(&mut tape, &[user], memory, &contexts, &[at]);
        let out = tape.value(out).row(0).to_owned();
        if !out.iter().all(|v| v.is_finite()) {
            return Err(AppError::NumericalInstability("user embedding".to_string()));
        }
        Ok(out)
    }

    pub fn get_recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
        at: f64,
    ) -> Result<Vec<ScoredItem>> {
        let items = self.model.item_table();
        let excluded = resolve_exclusions(&self.items, exclude);

        let ranked = match self.users.get(user_id) {
            Some(idx) => {
                let query = self.user_embedding_at(idx, at)?;
                rank_by_dot(query.view(), items, top_k, &excluded, |_| true)
            }
            None => {
                debug!(user_id, "Unknown user, using popularity fallback");
                rank_by_norm(items, top_k, &excluded, |_| true)
            }
        };
        Ok(to_scored(&self.items, ranked))
    }

    fn full_pass(&self) -> Result<EmbeddingTables> {
        let num_users = self.users.len();
        let items = self.model.item_table().clone();
        if num_users == 0 {
            return Ok(EmbeddingTables {
                users: Array2::zeros((0, self.model.config().embedding_dim)),
                items,
            });
        }

        let users: Vec<usize> = (0..num_users).collect();
        let mut memory = Array2::<f32>::zeros((num_users, self.model.config().memory_dim));
        for (user, mut row) in memory.outer_iter_mut().enumerate() {
            row.assign(&self.memory.current(user));
        }
        let contexts: Vec<Vec<Neighbor>> = users.iter().map(|&u| self.context(u, f64::INFINITY)).collect();
        let times: Vec<f64> = users
            .iter()
            .map(|&u| contexts[u].last().map(|n| n.timestamp).unwrap_or(0.0))
            .collect();

        let mut tape = Tape::new();
        let memory = tape.constant(memory);
        let out = self.model.embed_users(&mut tape, &users, memory, &contexts, &times);
        let tables = EmbeddingTables {
            users: tape.value(out).clone(),
            items,
        };
        tables.ensure_finite()?;
        Ok(tables)
    }

    /// Fresh embeddings of every user with current memory and context.
    pub fn compute_embeddings(&self) -> Result<Arc<EmbeddingTables>> {
        self.cache.refresh(|| self.full_pass())
    }

    pub fn embeddings(&self) -> Result<Arc<EmbeddingTables>> {
        self.cache.get_or_compute(|| self.full_pass())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::seeded_rng;
    use crate::services::tgn::tests::tiny_config;

    fn inference() -> TgnInference {
        let model = TgnModel::new(tiny_config(), 2, 4, &mut seeded_rng(11));
        TgnInference::new(
            model,
            NodeIndex::from_ids(["u0".to_string(), "u1".to_string()]),
            NodeIndex::from_ids((0..4).map(|i| format!("g{i}"))),
            MemoryState::zeros(2, 6),
        )
    }

    fn close(a: &Array1<f32>, b: &Array1<f32>) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-6)
    }

    #[test]
    fn test_later_interaction_invisible_to_earlier_query() {
        let mut in_order = inference();
        in_order.observe(0, 1, EventCode::Click, 1.0, 100.0).unwrap();
        let expected = in_order.user_embedding_at(0, 150.0).unwrap();

        let mut out_of_order = inference();
        out_of_order.observe(0, 2, EventCode::Play, 2.0, 200.0).unwrap();
        out_of_order.observe(0, 1, EventCode::Click, 1.0, 100.0).unwrap();
        let actual = out_of_order.user_embedding_at(0, 150.0).unwrap();

        assert!(close(&expected, &actual));
        let later = out_of_order.user_embedding_at(0, 250.0).unwrap();
        assert!(!close(&expected, &later));
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut engine = inference();
        for t in 0..20 {
            engine.observe(1, t % 4, EventCode::Click, 1.0, t as f64).unwrap();
        }
        let history = engine.history(1);
        assert_eq!(history.len(), engine.history_capacity());
        assert_eq!(history.last().map(|e| e.timestamp), Some(19.0));
    }

    #[test]
    fn test_reset_restores_baseline() {
        let mut engine = inference();
        let before = engine.user_embedding_at(0, 500.0).unwrap();
        engine.observe(0, 3, EventCode::Play, 2.0, 100.0).unwrap();
        assert_eq!(engine.live_users(), 1);

        engine.reset_user(0);
        assert_eq!(engine.live_users(), 0);
        assert!(engine.history(0).is_empty());
        assert!(close(&before, &engine.user_embedding_at(0, 500.0).unwrap()));
    }

    #[test]
    fn test_unknown_user_gets_popularity_list() {
        let engine = inference();
        let recs = engine
            .get_recommendations("stranger", 3, &HashSet::new(), 0.0)
            .unwrap();
        assert_eq!(recs.len(), 3);
        assert!(recs.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_exclusions_respected() {
        let engine = inference();
        let exclude: HashSet<String> = ["g0".to_string(), "g1".to_string()].into();
        let recs = engine.get_recommendations("u0", 4, &exclude, 0.0).unwrap();
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| !exclude.contains(&r.id)));
    }

    #[test]
    fn test_compute_embeddings_shapes() {
        let mut engine = inference();
        engine.observe(0, 0, EventCode::Click, 1.0, 10.0).unwrap();
        let tables = engine.compute_embeddings().unwrap();
        assert_eq!(tables.users.dim(), (2, 8));
        assert_eq!(tables.items.dim(), (4, 8));
    }
}
