// ============================================
// Relational event source
// ============================================
//
// Read-only access to the interaction tables. The lookback window applies
// to behavioral events; ratings and reviews are read in full.

use crate::error::Result;
use crate::models::{BehaviorEvent, EventKind, InteractionRecords, RatingRecord, ReviewRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

#[async_trait]
pub trait InteractionSource: Send + Sync {
    /// Interaction records, with events limited to the last `lookback_days`.
    async fn fetch_interactions(&self, lookback_days: i64) -> Result<InteractionRecords>;
}

/// Row shape of `user_events`.
type EventRow = (
    String,
    String,
    String,
    Option<f64>,
    Option<serde_json::Value>,
    DateTime<Utc>,
);

pub struct PgInteractionSource {
    pool: PgPool,
}

impl PgInteractionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!("Connected to interaction database");
        Ok(Self::new(pool))
    }

    async fn fetch_events(&self, since: DateTime<Utc>) -> Result<Vec<BehaviorEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT user_id::text, game_slug, event_type,
                   duration_seconds::float8, metadata, created_at
            FROM user_events
            WHERE created_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, item_id, event_type, duration, metadata, created_at)| BehaviorEvent {
                user_id,
                item_id,
                kind: EventKind::parse(&event_type),
                duration_secs: duration,
                device: metadata.as_ref().and_then(device_from_metadata),
                timestamp: created_at,
            })
            .collect())
    }

    async fn fetch_ratings(&self) -> Result<Vec<RatingRecord>> {
        let rows: Vec<(String, String, i32, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT user_id::text, game_slug, rating::int4, updated_at
            FROM user_ratings
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, item_id, stars, updated_at)| RatingRecord {
                user_id,
                item_id,
                stars,
                timestamp: updated_at,
            })
            .collect())
    }

    async fn fetch_reviews(&self) -> Result<Vec<ReviewRecord>> {
        let rows: Vec<(String, String, i32, Option<f64>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT user_id::text, game_slug, rating::int4,
                   sentiment_score::float8, updated_at
            FROM user_reviews
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, item_id, stars, sentiment, updated_at)| ReviewRecord {
                user_id,
                item_id,
                stars,
                sentiment,
                timestamp: updated_at,
            })
            .collect())
    }
}

#[async_trait]
impl InteractionSource for PgInteractionSource {
    async fn fetch_interactions(&self, lookback_days: i64) -> Result<InteractionRecords> {
        let since = Utc::now() - Duration::days(lookback_days.max(0));
        let records = InteractionRecords {
            events: self.fetch_events(since).await?,
            ratings: self.fetch_ratings().await?,
            reviews: self.fetch_reviews().await?,
        };
        debug!(
            events = records.events.len(),
            ratings = records.ratings.len(),
            reviews = records.reviews.len(),
            lookback_days,
            "Fetched interactions"
        );
        Ok(records)
    }
}

/// `device` or `deviceType` from event metadata.
pub fn device_from_metadata(metadata: &serde_json::Value) -> Option<String> {
    ["device", "deviceType"]
        .iter()
        .find_map(|key| metadata.get(key)?.as_str())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}
