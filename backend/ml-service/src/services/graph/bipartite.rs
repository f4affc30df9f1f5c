// ============================================
// Bipartite Graph Builder
// ============================================

use super::NodeIndex;
use crate::models::InteractionRecords;
use crate::services::weighting::WeightPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Result of an incremental edge insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Appended,
    /// Non-positive weight; nothing changed
    Ignored,
    /// User or item is not in the index; the graph must be rebuilt
    RebuildNeeded,
}

/// One aggregated user-item edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interaction {
    pub user: usize,
    pub item: usize,
    pub weight: f32,
}

/// Undirected user-item graph. Users occupy node ids `0..num_users` and
/// items `num_users..num_users + num_items`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BipartiteGraph {
    pub users: NodeIndex,
    pub items: NodeIndex,
    interactions: Vec<Interaction>,
    pair_lookup: HashMap<(usize, usize), usize>,
}

impl BipartiteGraph {
    pub fn new(users: NodeIndex, items: NodeIndex, interactions: Vec<Interaction>) -> Self {
        let pair_lookup = interactions
            .iter()
            .enumerate()
            .map(|(pos, edge)| ((edge.user, edge.item), pos))
            .collect();
        Self {
            users,
            items,
            interactions,
            pair_lookup,
        }
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.num_users() + self.num_items()
    }

    /// Directed edge count (every interaction is stored in both directions).
    pub fn num_edges(&self) -> usize {
        self.interactions.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Both directions of every interaction in combined node-id space.
    pub fn directed_edges(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        let offset = self.num_users();
        self.interactions.iter().flat_map(move |e| {
            [
                (e.user, offset + e.item, e.weight),
                (offset + e.item, e.user, e.weight),
            ]
        })
    }

    /// Positive items per user index.
    pub fn positives_by_user(&self) -> Vec<HashSet<usize>> {
        let mut positives = vec![HashSet::new(); self.num_users()];
        for edge in &self.interactions {
            positives[edge.user].insert(edge.item);
        }
        positives
    }

    pub fn add_interaction(&mut self, user_id: &str, item_id: &str, weight: f32) -> AddOutcome {
        if weight <= 0.0 {
            return AddOutcome::Ignored;
        }

        let (user, item) = match (self.users.get(user_id), self.items.get(item_id)) {
            (Some(u), Some(i)) => (u, i),
            _ => {
                debug!(user_id, item_id, "New node in interaction, rebuild needed");
                return AddOutcome::RebuildNeeded;
            }
        };

        match self.pair_lookup.get(&(user, item)) {
            Some(&pos) => self.interactions[pos].weight += weight,
            None => {
                self.pair_lookup.insert((user, item), self.interactions.len());
                self.interactions.push(Interaction { user, item, weight });
            }
        }
        AddOutcome::Appended
    }
}

#[derive(Debug, Clone, Default)]
pub struct BipartiteGraphBuilder {
    policy: WeightPolicy,
}

impl BipartiteGraphBuilder {
    pub fn new(policy: WeightPolicy) -> Self {
        Self { policy }
    }

    pub fn build(&self, records: &InteractionRecords, now: DateTime<Utc>) -> BipartiteGraph {
        let mut aggregate: BTreeMap<(String, String), f64> = BTreeMap::new();

        for event in &records.events {
            let weight = self.policy.decayed_event(event, now);
            if weight != 0.0 {
                *aggregate
                    .entry((event.user_id.clone(), event.item_id.clone()))
                    .or_insert(0.0) += weight;
            }
        }

        // Reviews replace plain ratings for the same pair
        let mut reviewed: HashSet<(&str, &str)> = HashSet::new();
        for review in &records.reviews {
            reviewed.insert((review.user_id.as_str(), review.item_id.as_str()));
            *aggregate
                .entry((review.user_id.clone(), review.item_id.clone()))
                .or_insert(0.0) += self.policy.decayed_review(review, now);
        }

        for rating in &records.ratings {
            if reviewed.contains(&(rating.user_id.as_str(), rating.item_id.as_str())) {
                continue;
            }
            *aggregate
                .entry((rating.user_id.clone(), rating.item_id.clone()))
                .or_insert(0.0) += self.policy.decayed_rating(rating, now);
        }

        let total_pairs = aggregate.len();
        let positive: Vec<((String, String), f64)> =
            aggregate.into_iter().filter(|(_, w)| *w > 0.0).collect();

        let users = NodeIndex::from_ids(positive.iter().map(|((u, _), _)| u.clone()));
        let items = NodeIndex::from_ids(positive.iter().map(|((_, i), _)| i.clone()));

        let interactions: Vec<Interaction> = positive
            .iter()
            .filter_map(|((u, i), w)| {
                Some(Interaction {
                    user: users.get(u)?,
                    item: items.get(i)?,
                    weight: *w as f32,
                })
            })
            .collect();

        info!(
            users = users.len(),
            items = items.len(),
            edges = interactions.len() * 2,
            dropped_pairs = total_pairs - interactions.len(),
            "Built bipartite graph"
        );

        BipartiteGraph::new(users, items, interactions)
    }
}
