// ============================================
// Heterogeneous Graph Builder
// ============================================
//
// Merges relational interactions with CMS metadata into a typed graph:
//   user -played/rated-> game, user -uses-> device,
//   game -made_by-> provider, game -has_badge-> badge,
//   promotion -features-> game
// Each relation is stored together with its explicit reverse.

use super::NodeIndex;
use crate::models::{GameMetadata, InteractionRecords, PromotionMetadata};
use crate::services::weighting::WeightPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    User,
    Game,
    Provider,
    Promotion,
    Device,
    Badge,
}

impl NodeType {
    pub const ALL: [NodeType; 6] = [
        NodeType::User,
        NodeType::Game,
        NodeType::Provider,
        NodeType::Promotion,
        NodeType::Device,
        NodeType::Badge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::User => "user",
            NodeType::Game => "game",
            NodeType::Provider => "provider",
            NodeType::Promotion => "promotion",
            NodeType::Device => "device",
            NodeType::Badge => "badge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Played,
    Rated,
    MadeBy,
    HasBadge,
    Features,
    Uses,
    RevPlayed,
    RevRated,
    RevMadeBy,
    RevHasBadge,
    RevFeatures,
    RevUses,
}

impl Relation {
    pub fn reverse(self) -> Self {
        match self {
            Relation::Played => Relation::RevPlayed,
            Relation::Rated => Relation::RevRated,
            Relation::MadeBy => Relation::RevMadeBy,
            Relation::HasBadge => Relation::RevHasBadge,
            Relation::Features => Relation::RevFeatures,
            Relation::Uses => Relation::RevUses,
            Relation::RevPlayed => Relation::Played,
            Relation::RevRated => Relation::Rated,
            Relation::RevMadeBy => Relation::MadeBy,
            Relation::RevHasBadge => Relation::HasBadge,
            Relation::RevFeatures => Relation::Features,
            Relation::RevUses => Relation::Uses,
        }
    }

    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            Relation::RevPlayed
                | Relation::RevRated
                | Relation::RevMadeBy
                | Relation::RevHasBadge
                | Relation::RevFeatures
                | Relation::RevUses
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Played => "played",
            Relation::Rated => "rated",
            Relation::MadeBy => "made_by",
            Relation::HasBadge => "has_badge",
            Relation::Features => "features",
            Relation::Uses => "uses",
            Relation::RevPlayed => "rev_played",
            Relation::RevRated => "rev_rated",
            Relation::RevMadeBy => "rev_made_by",
            Relation::RevHasBadge => "rev_has_badge",
            Relation::RevFeatures => "rev_features",
            Relation::RevUses => "rev_uses",
        }
    }
}

/// `(source type, relation, destination type)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeType {
    pub src: NodeType,
    pub relation: Relation,
    pub dst: NodeType,
}

impl EdgeType {
    pub const fn new(src: NodeType, relation: Relation, dst: NodeType) -> Self {
        Self { src, relation, dst }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            relation: self.relation.reverse(),
            dst: self.src,
        }
    }

    pub fn key(&self) -> String {
        format!("{}__{}__{}", self.src.as_str(), self.relation.as_str(), self.dst.as_str())
    }

    /// Every relation the builder can emit, forward and reverse.
    pub fn all() -> Vec<EdgeType> {
        FORWARD_EDGE_TYPES
            .iter()
            .flat_map(|et| [*et, et.reverse()])
            .collect()
    }
}

pub const PLAYED: EdgeType = EdgeType::new(NodeType::User, Relation::Played, NodeType::Game);
pub const RATED: EdgeType = EdgeType::new(NodeType::User, Relation::Rated, NodeType::Game);
pub const MADE_BY: EdgeType = EdgeType::new(NodeType::Game, Relation::MadeBy, NodeType::Provider);
pub const HAS_BADGE: EdgeType = EdgeType::new(NodeType::Game, Relation::HasBadge, NodeType::Badge);
pub const FEATURES: EdgeType =
    EdgeType::new(NodeType::Promotion, Relation::Features, NodeType::Game);
pub const USES: EdgeType = EdgeType::new(NodeType::User, Relation::Uses, NodeType::Device);

pub const FORWARD_EDGE_TYPES: [EdgeType; 6] = [PLAYED, RATED, MADE_BY, HAS_BADGE, FEATURES, USES];

/// Edge list for a single relation, aligned by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeBlock {
    pub src: Vec<usize>,
    pub dst: Vec<usize>,
    pub weight: Option<Vec<f32>>,
}

impl EdgeBlock {
    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    fn reversed(&self) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
            weight: self.weight.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub nodes: BTreeMap<String, usize>,
    pub edges: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeteroGraph {
    nodes: BTreeMap<NodeType, NodeIndex>,
    edges: BTreeMap<EdgeType, EdgeBlock>,
}

impl HeteroGraph {
    pub fn index(&self, node_type: NodeType) -> Option<&NodeIndex> {
        self.nodes.get(&node_type)
    }

    pub fn lookup(&self, node_type: NodeType, id: &str) -> Option<usize> {
        self.nodes.get(&node_type)?.get(id)
    }

    pub fn num_nodes(&self, node_type: NodeType) -> usize {
        self.nodes.get(&node_type).map_or(0, NodeIndex::len)
    }

    pub fn edges(&self, edge_type: &EdgeType) -> Option<&EdgeBlock> {
        self.edges.get(edge_type)
    }

    pub fn edge_types(&self) -> impl Iterator<Item = (&EdgeType, &EdgeBlock)> {
        self.edges.iter()
    }

    pub fn num_edges(&self, edge_type: &EdgeType) -> usize {
        self.edges.get(edge_type).map_or(0, EdgeBlock::len)
    }

    pub fn total_edges(&self) -> usize {
        self.edges.values().map(EdgeBlock::len).sum()
    }

    /// Sorted ids per node type, as stored in checkpoints.
    pub fn mappings(&self) -> BTreeMap<String, Vec<String>> {
        NodeType::ALL
            .iter()
            .map(|nt| {
                let ids = self.nodes.get(nt).map(|n| n.ids().to_vec()).unwrap_or_default();
                (nt.as_str().to_string(), ids)
            })
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            nodes: NodeType::ALL
                .iter()
                .map(|nt| (nt.as_str().to_string(), self.num_nodes(*nt)))
                .collect(),
            edges: self.edges.iter().map(|(et, block)| (et.key(), block.len())).collect(),
        }
    }

    /// Source indices of `edge_type` edges ending at node `dst_id`.
    pub fn linked_sources(&self, edge_type: &EdgeType, dst_id: &str) -> Vec<usize> {
        let Some(dst) = self.lookup(edge_type.dst, dst_id) else {
            return Vec::new();
        };
        self.edges(edge_type)
            .map(|block| {
                block
                    .src
                    .iter()
                    .zip(&block.dst)
                    .filter(|(_, d)| **d == dst)
                    .map(|(src, _)| *src)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Games linked to a provider through `made_by`.
    pub fn provider_games(&self, provider_id: &str) -> Vec<usize> {
        self.linked_sources(&MADE_BY, provider_id)
    }

    /// Games carrying a badge through `has_badge`.
    pub fn badge_games(&self, badge: &str) -> Vec<usize> {
        self.linked_sources(&HAS_BADGE, badge)
    }

    fn insert_with_reverse(&mut self, edge_type: EdgeType, block: EdgeBlock) {
        if block.is_empty() {
            return;
        }
        self.edges.insert(edge_type.reverse(), block.reversed());
        self.edges.insert(edge_type, block);
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeteroGraphBuilder {
    policy: WeightPolicy,
}

impl HeteroGraphBuilder {
    pub fn new(policy: WeightPolicy) -> Self {
        Self { policy }
    }

    pub fn build(
        &self,
        records: &InteractionRecords,
        games: &[GameMetadata],
        promotions: &[PromotionMetadata],
        now: DateTime<Utc>,
    ) -> HeteroGraph {
        let mut user_ids: BTreeSet<String> = BTreeSet::new();
        let mut game_ids: BTreeSet<String> = BTreeSet::new();
        let mut device_ids: BTreeSet<String> = BTreeSet::new();

        // Metadata nodes
        let mut provider_ids: BTreeSet<String> = BTreeSet::new();
        let mut badge_ids: BTreeSet<String> = BTreeSet::new();
        for game in games {
            game_ids.insert(game.slug.clone());
            if let Some(provider) = &game.provider {
                provider_ids.insert(provider.clone());
            }
            badge_ids.extend(game.badges.iter().cloned());
        }
        let promotion_ids: BTreeSet<String> = promotions.iter().map(|p| p.id.clone()).collect();

        // Interaction aggregation
        let mut played: BTreeMap<(String, String), f64> = BTreeMap::new();
        let mut uses: BTreeSet<(String, String)> = BTreeSet::new();
        for event in &records.events {
            user_ids.insert(event.user_id.clone());
            game_ids.insert(event.item_id.clone());

            let weight = self.policy.decayed_event(event, now);
            if weight > 0.0 {
                *played
                    .entry((event.user_id.clone(), event.item_id.clone()))
                    .or_insert(0.0) += weight;
            }
            if let Some(device) = &event.device {
                device_ids.insert(device.clone());
                uses.insert((event.user_id.clone(), device.clone()));
            }
        }

        let mut rated: BTreeMap<(String, String), f64> = BTreeMap::new();
        let mut reviewed: HashSet<(String, String)> = HashSet::new();
        for review in &records.reviews {
            user_ids.insert(review.user_id.clone());
            game_ids.insert(review.item_id.clone());
            let key = (review.user_id.clone(), review.item_id.clone());
            let weight = self.policy.decayed_review(review, now);
            let entry = rated.entry(key.clone()).or_insert(weight);
            *entry = entry.max(weight);
            reviewed.insert(key);
        }
        for rating in &records.ratings {
            user_ids.insert(rating.user_id.clone());
            game_ids.insert(rating.item_id.clone());
            let key = (rating.user_id.clone(), rating.item_id.clone());
            if reviewed.contains(&key) {
                continue;
            }
            let weight = self.policy.decayed_rating(rating, now);
            let entry = rated.entry(key).or_insert(weight);
            *entry = entry.max(weight);
        }

        let mut graph = HeteroGraph::default();
        graph.nodes.insert(NodeType::User, NodeIndex::from_ids(user_ids));
        graph.nodes.insert(NodeType::Game, NodeIndex::from_ids(game_ids));
        graph.nodes.insert(NodeType::Provider, NodeIndex::from_ids(provider_ids));
        graph.nodes.insert(NodeType::Promotion, NodeIndex::from_ids(promotion_ids));
        graph.nodes.insert(NodeType::Device, NodeIndex::from_ids(device_ids));
        graph.nodes.insert(NodeType::Badge, NodeIndex::from_ids(badge_ids));

        let played_block = weighted_block(&graph, PLAYED, played);
        let rated_block = weighted_block(&graph, RATED, rated);
        let uses_block = plain_block(&graph, USES, uses);

        let made_by = games
            .iter()
            .filter_map(|g| Some((g.slug.clone(), g.provider.clone()?)))
            .collect();
        let made_by_block = plain_block(&graph, MADE_BY, made_by);

        let has_badge = games
            .iter()
            .flat_map(|g| g.badges.iter().map(move |b| (g.slug.clone(), b.clone())))
            .collect();
        let has_badge_block = plain_block(&graph, HAS_BADGE, has_badge);

        // Featured games outside the known catalog are skipped
        let features = promotions
            .iter()
            .flat_map(|p| p.featured_games.iter().map(move |g| (p.id.clone(), g.clone())))
            .collect();
        let features_block = plain_block(&graph, FEATURES, features);

        graph.insert_with_reverse(PLAYED, played_block);
        graph.insert_with_reverse(RATED, rated_block);
        graph.insert_with_reverse(USES, uses_block);
        graph.insert_with_reverse(MADE_BY, made_by_block);
        graph.insert_with_reverse(HAS_BADGE, has_badge_block);
        graph.insert_with_reverse(FEATURES, features_block);

        info!(
            users = graph.num_nodes(NodeType::User),
            games = graph.num_nodes(NodeType::Game),
            providers = graph.num_nodes(NodeType::Provider),
            promotions = graph.num_nodes(NodeType::Promotion),
            devices = graph.num_nodes(NodeType::Device),
            badges = graph.num_nodes(NodeType::Badge),
            edges = graph.total_edges(),
            "Built heterogeneous graph"
        );

        graph
    }
}

fn weighted_block(
    graph: &HeteroGraph,
    edge_type: EdgeType,
    pairs: BTreeMap<(String, String), f64>,
) -> EdgeBlock {
    let mut block = EdgeBlock {
        weight: Some(Vec::new()),
        ..Default::default()
    };
    for ((src, dst), weight) in pairs {
        if weight <= 0.0 {
            continue;
        }
        if let (Some(s), Some(d)) = (
            graph.lookup(edge_type.src, &src),
            graph.lookup(edge_type.dst, &dst),
        ) {
            block.src.push(s);
            block.dst.push(d);
            if let Some(weights) = block.weight.as_mut() {
                weights.push(weight as f32);
            }
        }
    }
    block
}

fn plain_block(
    graph: &HeteroGraph,
    edge_type: EdgeType,
    pairs: BTreeSet<(String, String)>,
) -> EdgeBlock {
    let mut block = EdgeBlock::default();
    for (src, dst) in pairs {
        if let (Some(s), Some(d)) = (
            graph.lookup(edge_type.src, &src),
            graph.lookup(edge_type.dst, &dst),
        ) {
            block.src.push(s);
            block.dst.push(d);
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BehaviorEvent, EventKind, RatingRecord};

    fn fixture(now: DateTime<Utc>) -> (InteractionRecords, Vec<GameMetadata>, Vec<PromotionMetadata>) {
        let records = InteractionRecords {
            events: vec![
                BehaviorEvent {
                    user_id: "u1".to_string(),
                    item_id: "starburst".to_string(),
                    kind: EventKind::Play,
                    duration_secs: Some(120.0),
                    device: Some("mobile".to_string()),
                    timestamp: now,
                },
                BehaviorEvent {
                    user_id: "u2".to_string(),
                    item_id: "book-of-dead".to_string(),
                    kind: EventKind::Click,
                    duration_secs: None,
                    device: Some("desktop".to_string()),
                    timestamp: now,
                },
            ],
            ratings: vec![
                RatingRecord {
                    user_id: "u1".to_string(),
                    item_id: "book-of-dead".to_string(),
                    stars: 5,
                    timestamp: now,
                },
                RatingRecord {
                    user_id: "u2".to_string(),
                    item_id: "starburst".to_string(),
                    stars: 1,
                    timestamp: now,
                },
            ],
            reviews: vec![],
        };
        let games = vec![
            GameMetadata {
                slug: "starburst".to_string(),
                provider: Some("NetEnt".to_string()),
                badges: vec!["hot".to_string(), "new".to_string()],
            },
            GameMetadata {
                slug: "book-of-dead".to_string(),
                provider: Some("Play'n GO".to_string()),
                badges: vec![],
            },
            GameMetadata {
                slug: "gonzos-quest".to_string(),
                provider: Some("NetEnt".to_string()),
                badges: vec!["hot".to_string()],
            },
        ];
        let promotions = vec![PromotionMetadata {
            id: "summer".to_string(),
            featured_games: vec!["starburst".to_string(), "unknown-game".to_string()],
        }];
        (records, games, promotions)
    }

    #[test]
    fn test_reverse_edges_mirror_forward() {
        let now = Utc::now();
        let (records, games, promotions) = fixture(now);
        let graph = HeteroGraphBuilder::default().build(&records, &games, &promotions, now);

        let mut forward_seen = 0;
        for (edge_type, block) in graph.edge_types() {
            if edge_type.relation.is_reverse() {
                continue;
            }
            forward_seen += 1;
            let reverse = graph
                .edges(&edge_type.reverse())
                .unwrap_or_else(|| panic!("missing reverse for {}", edge_type.key()));
            assert_eq!(reverse.len(), block.len());
            assert_eq!(reverse.src, block.dst);
            assert_eq!(reverse.dst, block.src);
        }
        assert_eq!(forward_seen, 6);
    }

    #[test]
    fn test_node_counts_and_edges() {
        let now = Utc::now();
        let (records, games, promotions) = fixture(now);
        let graph = HeteroGraphBuilder::default().build(&records, &games, &promotions, now);

        assert_eq!(graph.num_nodes(NodeType::User), 2);
        assert_eq!(graph.num_nodes(NodeType::Game), 3);
        assert_eq!(graph.num_nodes(NodeType::Provider), 2);
        assert_eq!(graph.num_nodes(NodeType::Promotion), 1);
        assert_eq!(graph.num_nodes(NodeType::Device), 2);
        assert_eq!(graph.num_nodes(NodeType::Badge), 2);

        // Negative one-star rating is not an edge
        assert_eq!(graph.num_edges(&RATED), 1);
        assert_eq!(graph.num_edges(&PLAYED), 2);
        // Unknown featured game skipped
        assert_eq!(graph.num_edges(&FEATURES), 1);
        assert_eq!(graph.num_edges(&HAS_BADGE), 3);
        assert!(graph.edges(&PLAYED).and_then(|b| b.weight.as_ref()).is_some());
    }

    #[test]
    fn test_missing_metadata_still_builds() {
        let now = Utc::now();
        let (records, _, _) = fixture(now);
        let graph = HeteroGraphBuilder::default().build(&records, &[], &[], now);

        assert_eq!(graph.num_nodes(NodeType::Provider), 0);
        assert_eq!(graph.num_nodes(NodeType::Promotion), 0);
        assert!(graph.edges(&MADE_BY).is_none());
        assert!(graph.num_edges(&PLAYED) > 0);
    }

    #[test]
    fn test_provider_games() {
        let now = Utc::now();
        let (records, games, promotions) = fixture(now);
        let graph = HeteroGraphBuilder::default().build(&records, &games, &promotions, now);

        let netent = graph.provider_games("NetEnt");
        assert_eq!(netent.len(), 2);
        assert!(graph.provider_games("Unknown Studio").is_empty());
    }
}
