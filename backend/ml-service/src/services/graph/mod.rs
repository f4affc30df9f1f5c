//! Graph construction shared by the three embedding engines.
//!
//! Every builder reads the same [`InteractionRecords`](crate::models::InteractionRecords)
//! and weighs them through one [`WeightPolicy`](crate::services::weighting::WeightPolicy).

pub mod bipartite;
pub mod hetero;
pub mod temporal;

pub use bipartite::{AddOutcome, BipartiteGraph, BipartiteGraphBuilder};
pub use hetero::{EdgeBlock, EdgeType, HeteroGraph, HeteroGraphBuilder, NodeType, Relation};
pub use temporal::{TemporalEdge, TemporalEdgeBuilder, TemporalGraph};

use std::collections::HashMap;

/// Bijection between stable string ids and dense indices for one node type.
///
/// Indices follow the sorted order of the ids, so two builds over the same
/// data always agree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeIndex {
    ids: Vec<String>,
    lookup: HashMap<String, usize>,
}

impl NodeIndex {
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let lookup = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        Self { ids, lookup }
    }

    pub fn get(&self, id: &str) -> Option<usize> {
        self.lookup.get(id).copied()
    }

    pub fn id(&self, idx: usize) -> Option<&str> {
        self.ids.get(idx).map(String::as_str)
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
