// ============================================
// LightGCN: bipartite embedding propagation
// ============================================
//
// Learnable base embeddings smoothed over K rounds of symmetric-normalized
// neighbor averaging. No per-layer transform and no activation; the final
// representation is the mean of all K + 1 rounds.

pub mod inference;
pub mod trainer;

pub use inference::LightGcnInference;
pub use trainer::LightGcnTrainer;

use crate::config::LightGcnConfig;
use crate::error::Result;
use crate::nn::{xavier_uniform, ParamId, ParamStore, SparseMatrix, Tape, Var};
use crate::services::graph::BipartiteGraph;
use crate::services::inference::EmbeddingTables;
use ndarray::s;
use rand::rngs::StdRng;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LightGcn {
    config: LightGcnConfig,
    num_users: usize,
    num_items: usize,
    params: ParamStore,
    user_embedding: ParamId,
    item_embedding: ParamId,
    adjacency: Arc<SparseMatrix>,
}

/// Rounds produced by one propagation pass.
#[derive(Debug, Clone, Copy)]
pub struct Propagation {
    /// Round-zero embeddings, users then items
    pub base: Var,
    /// Mean over every round
    pub output: Var,
}

impl LightGcn {
    pub fn new(config: LightGcnConfig, graph: &BipartiteGraph, rng: &mut StdRng) -> Self {
        let num_users = graph.num_users();
        let num_items = graph.num_items();
        let dim = config.embedding_dim;

        let mut params = ParamStore::default();
        let user_embedding = params.add("user_embedding", xavier_uniform(num_users, dim, rng));
        let item_embedding = params.add("item_embedding", xavier_uniform(num_items, dim, rng));

        Self {
            config,
            num_users,
            num_items,
            params,
            user_embedding,
            item_embedding,
            adjacency: Arc::new(normalized_adjacency(graph)),
        }
    }

    pub fn config(&self) -> &LightGcnConfig {
        &self.config
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    pub fn adjacency(&self) -> &SparseMatrix {
        &self.adjacency
    }

    pub fn propagate(&self, tape: &mut Tape) -> Propagation {
        let users = tape.param(&self.params, self.user_embedding);
        let items = tape.param(&self.params, self.item_embedding);
        let base = tape.concat_rows(&[users, items]);

        let mut current = base;
        let mut total = base;
        for _ in 0..self.config.num_layers {
            current = tape.spmm(self.adjacency.clone(), current);
            total = tape.add(total, current);
        }
        let output = tape.scale(total, 1.0 / (self.config.num_layers + 1) as f32);

        Propagation { base, output }
    }

    /// Full forward pass without gradient bookkeeping beyond one tape.
    pub fn embeddings(&self) -> Result<EmbeddingTables> {
        let mut tape = Tape::new();
        let out = self.propagate(&mut tape).output;
        let all = tape.value(out);
        let tables = EmbeddingTables {
            users: all.slice(s![..self.num_users, ..]).to_owned(),
            items: all.slice(s![self.num_users.., ..]).to_owned(),
        };
        tables.ensure_finite()?;
        Ok(tables)
    }
}

/// `D^-1/2 A D^-1/2` scaled by edge weight, aggregated at the edge target.
/// Zero-degree nodes get a factor of exactly zero.
pub fn normalized_adjacency(graph: &BipartiteGraph) -> SparseMatrix {
    let n = graph.num_nodes();
    let mut degree = vec![0.0_f32; n];
    for (_, dst, _) in graph.directed_edges() {
        degree[dst] += 1.0;
    }
    let inv_sqrt: Vec<f32> = degree
        .iter()
        .map(|&d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 })
        .collect();

    let entries = graph
        .directed_edges()
        .map(|(src, dst, w)| (dst, src, inv_sqrt[src] * inv_sqrt[dst] * w))
        .collect();
    SparseMatrix::new(n, n, entries)
}
