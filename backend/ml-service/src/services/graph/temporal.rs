// ============================================
// Temporal Edge Builder
// ============================================

use super::NodeIndex;
use crate::models::{EventCode, InteractionRecords};
use crate::services::weighting::WeightPolicy;
use chrono::{DateTime, Utc};
use tracing::info;

/// One discrete interaction in the chronological stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalEdge {
    pub user: usize,
    pub item: usize,
    /// Unix seconds
    pub timestamp: f64,
    pub event: EventCode,
    pub weight: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemporalGraph {
    pub users: NodeIndex,
    pub items: NodeIndex,
    /// Sorted by timestamp ascending
    pub edges: Vec<TemporalEdge>,
}

impl TemporalGraph {
    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

pub fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Default)]
pub struct TemporalEdgeBuilder {
    policy: WeightPolicy,
}

struct RawEdge {
    user_id: String,
    item_id: String,
    timestamp: f64,
    event: EventCode,
    weight: f64,
}

impl TemporalEdgeBuilder {
    pub fn new(policy: WeightPolicy) -> Self {
        Self { policy }
    }

    /// One edge per record with positive base weight. Time is carried on
    /// the edge itself, so no decay is applied here.
    pub fn build(&self, records: &InteractionRecords) -> TemporalGraph {
        let mut raw: Vec<RawEdge> = Vec::with_capacity(records.len());

        for event in &records.events {
            let Some(code) = EventCode::from_kind(event.kind) else {
                continue;
            };
            raw.push(RawEdge {
                user_id: event.user_id.clone(),
                item_id: event.item_id.clone(),
                timestamp: unix_seconds(event.timestamp),
                event: code,
                weight: self.policy.event_weight(event.kind, event.duration_secs),
            });
        }

        for rating in &records.ratings {
            raw.push(RawEdge {
                user_id: rating.user_id.clone(),
                item_id: rating.item_id.clone(),
                timestamp: unix_seconds(rating.timestamp),
                event: EventCode::Rating,
                weight: self.policy.rating_weight(rating.stars),
            });
        }

        for review in &records.reviews {
            raw.push(RawEdge {
                user_id: review.user_id.clone(),
                item_id: review.item_id.clone(),
                timestamp: unix_seconds(review.timestamp),
                event: EventCode::Review,
                weight: self.policy.review_weight(review.stars, review.sentiment),
            });
        }

        raw.retain(|e| e.weight > 0.0);

        let users = NodeIndex::from_ids(raw.iter().map(|e| e.user_id.clone()));
        let items = NodeIndex::from_ids(raw.iter().map(|e| e.item_id.clone()));

        let mut edges: Vec<TemporalEdge> = raw
            .iter()
            .filter_map(|e| {
                Some(TemporalEdge {
                    user: users.get(&e.user_id)?,
                    item: items.get(&e.item_id)?,
                    timestamp: e.timestamp,
                    event: e.event,
                    weight: e.weight as f32,
                })
            })
            .collect();

        edges.sort_by(|a, b| {
            a.timestamp
                .total_cmp(&b.timestamp)
                .then(a.user.cmp(&b.user))
                .then(a.item.cmp(&b.item))
                .then(a.event.index().cmp(&b.event.index()))
        });

        info!(
            users = users.len(),
            items = items.len(),
            edges = edges.len(),
            "Built temporal edge stream"
        );

        TemporalGraph {
            users,
            items,
            edges,
        }
    }
}
