use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Raw interaction records
// ============================================

/// Behavioral event kind as stored in the event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Impression,
    Click,
    /// `play_start`, `play_end` and `game_time`
    Play,
    /// Anything else; contributes nothing
    Unknown,
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "impression" => EventKind::Impression,
            "click" => EventKind::Click,
            "play_start" | "play_end" | "game_time" => EventKind::Play,
            _ => EventKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Impression => "impression",
            EventKind::Click => "click",
            EventKind::Play => "play",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Fixed event-type codes carried on temporal edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCode {
    Impression = 0,
    Click = 1,
    Play = 2,
    Rating = 3,
    Review = 4,
}

impl EventCode {
    pub const COUNT: usize = 5;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_kind(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Impression => Some(EventCode::Impression),
            EventKind::Click => Some(EventCode::Click),
            EventKind::Play => Some(EventCode::Play),
            EventKind::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub user_id: String,
    pub item_id: String,
    pub kind: EventKind,
    pub duration_secs: Option<f64>,
    pub device: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingRecord {
    pub user_id: String,
    pub item_id: String,
    pub stars: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub user_id: String,
    pub item_id: String,
    pub stars: i32,
    /// Sentiment in [-1, 1] when the review was scored
    pub sentiment: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the graph builders read from the relational store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InteractionRecords {
    pub events: Vec<BehaviorEvent>,
    pub ratings: Vec<RatingRecord>,
    pub reviews: Vec<ReviewRecord>,
}

impl InteractionRecords {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.ratings.is_empty() && self.reviews.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len() + self.ratings.len() + self.reviews.len()
    }
}

// ============================================
// Content metadata
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMetadata {
    pub slug: String,
    pub provider: Option<String>,
    pub badges: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionMetadata {
    pub id: String,
    pub featured_games: Vec<String>,
}

// ============================================
// Results
// ============================================

/// A ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    LightGcn,
    Tgn,
    Hgt,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::LightGcn => "lightgcn",
            EngineKind::Tgn => "tgn",
            EngineKind::Hgt => "hgt",
        }
    }

    pub fn user_collection(&self) -> String {
        format!("{}_users", self.as_str())
    }

    pub fn item_collection(&self) -> String {
        format!("{}_games", self.as_str())
    }

    pub fn checkpoint_file(&self) -> String {
        format!("{}.ckpt", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainRequest {
    /// Ignore any saved checkpoint and start from fresh parameters
    pub force_retrain: bool,
    pub epochs: Option<usize>,
    pub lookback_days: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Completed,
    /// No positive interactions; zero epochs were run
    NoData,
}

/// Per-run outcome of a training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub engine: EngineKind,
    pub status: TrainingStatus,
    pub epochs_run: usize,
    pub final_loss: Option<f32>,
    pub best_loss: Option<f32>,
    pub losses: Vec<f32>,
    pub num_users: usize,
    pub num_items: usize,
    pub num_edges: usize,
    pub resumed_from_checkpoint: bool,
    pub checkpoint_saved: bool,
    pub synced: SyncReport,
}

impl TrainingReport {
    pub fn no_data(engine: EngineKind) -> Self {
        Self {
            engine,
            status: TrainingStatus::NoData,
            epochs_run: 0,
            final_loss: None,
            best_loss: None,
            losses: Vec::new(),
            num_users: 0,
            num_items: 0,
            num_edges: 0,
            resumed_from_checkpoint: false,
            checkpoint_saved: false,
            synced: SyncReport::default(),
        }
    }
}

/// Loss history produced by one of the engine trainers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub losses: Vec<f32>,
}

impl LossHistory {
    pub fn push(&mut self, loss: f32) {
        self.losses.push(loss);
    }

    pub fn last(&self) -> Option<f32> {
        self.losses.last().copied()
    }

    pub fn best(&self) -> Option<f32> {
        self.losses.iter().copied().fold(None, |best, l| match best {
            Some(b) if b <= l => Some(b),
            _ => Some(l),
        })
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }
}

/// Embedding upload tally; failures are counted, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub users_written: usize,
    pub items_written: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    NoSavedModel,
    Rejected(String),
}
