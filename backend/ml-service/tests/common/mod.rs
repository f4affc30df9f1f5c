#![allow(dead_code)]

pub mod fixtures {
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use ml_service::clients::{InMemoryVectorStore, MetadataSource};
    use ml_service::config::{
        Config, HgtConfig, JobKind, LightGcnConfig, SessionConfig, TgnConfig, WeightingConfig,
    };
    use ml_service::db::InteractionSource;
    use ml_service::models::{
        BehaviorEvent, EventKind, GameMetadata, InteractionRecords, PromotionMetadata, RatingRecord,
    };
    use ml_service::{MlService, Result};
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Small dimensions so every engine trains in milliseconds.
    pub fn test_config(checkpoint_dir: &Path) -> Config {
        Config {
            database_url: "postgres://unused".to_string(),
            cms_url: "http://unused".to_string(),
            vector_store_url: String::new(),
            checkpoint_dir: checkpoint_dir.to_string_lossy().into_owned(),
            job: JobKind::All,
            seed: 7,
            log_format: "text".to_string(),
            weighting: WeightingConfig::default(),
            lightgcn: LightGcnConfig {
                embedding_dim: 8,
                num_layers: 2,
                learning_rate: 0.01,
                batch_size: 8,
                epochs: 3,
                ..LightGcnConfig::default()
            },
            tgn: TgnConfig {
                embedding_dim: 8,
                memory_dim: 6,
                time_dim: 4,
                message_dim: 8,
                num_heads: 2,
                num_neighbors: 3,
                learning_rate: 0.01,
                batch_size: 4,
                epochs: 2,
                ..TgnConfig::default()
            },
            hgt: HgtConfig {
                hidden_dim: 8,
                embedding_dim: 6,
                num_heads: 2,
                num_layers: 2,
                learning_rate: 0.01,
                batch_size: 8,
                epochs: 3,
                ..HgtConfig::default()
            },
            session: SessionConfig::default(),
        }
    }

    fn play(user: &str, game: &str, minutes_ago: i64, device: &str) -> BehaviorEvent {
        BehaviorEvent {
            user_id: user.to_string(),
            item_id: game.to_string(),
            kind: EventKind::Play,
            duration_secs: Some(300.0),
            device: Some(device.to_string()),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn click(user: &str, game: &str, minutes_ago: i64) -> BehaviorEvent {
        BehaviorEvent {
            user_id: user.to_string(),
            item_id: game.to_string(),
            kind: EventKind::Click,
            duration_secs: None,
            device: None,
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    /// Four users over five games with a clear split between two tastes.
    pub fn sample_records() -> InteractionRecords {
        InteractionRecords {
            events: vec![
                play("alice", "starburst", 120, "mobile"),
                play("alice", "gonzos-quest", 110, "mobile"),
                click("alice", "book-of-dead", 100),
                play("bob", "starburst", 90, "desktop"),
                play("bob", "gonzos-quest", 80, "desktop"),
                play("carol", "book-of-dead", 70, "mobile"),
                play("carol", "reactoonz", 60, "mobile"),
                click("dave", "reactoonz", 50),
                play("dave", "fire-joker", 40, "desktop"),
                play("dave", "book-of-dead", 30, "desktop"),
            ],
            ratings: vec![RatingRecord {
                user_id: "bob".to_string(),
                item_id: "fire-joker".to_string(),
                stars: 5,
                timestamp: Utc::now() - Duration::minutes(20),
            }],
            reviews: vec![],
        }
    }

    pub fn sample_games() -> Vec<GameMetadata> {
        let game = |slug: &str, provider: &str, badges: &[&str]| GameMetadata {
            slug: slug.to_string(),
            provider: Some(provider.to_string()),
            badges: badges.iter().map(|b| b.to_string()).collect(),
        };
        vec![
            game("starburst", "netent", &["popular"]),
            game("gonzos-quest", "netent", &[]),
            game("book-of-dead", "playngo", &["popular"]),
            game("reactoonz", "playngo", &["new"]),
            game("fire-joker", "playngo", &[]),
        ]
    }

    pub fn sample_promotions() -> Vec<PromotionMetadata> {
        vec![PromotionMetadata {
            id: "summer".to_string(),
            featured_games: vec!["starburst".to_string(), "reactoonz".to_string()],
        }]
    }

    pub struct StaticSource {
        pub records: InteractionRecords,
    }

    #[async_trait]
    impl InteractionSource for StaticSource {
        async fn fetch_interactions(&self, _lookback_days: i64) -> Result<InteractionRecords> {
            Ok(self.records.clone())
        }
    }

    /// Holds every fetch until `release` is notified.
    pub struct BlockingSource {
        pub records: InteractionRecords,
        pub started: Arc<Notify>,
        pub release: Arc<Notify>,
    }

    #[async_trait]
    impl InteractionSource for BlockingSource {
        async fn fetch_interactions(&self, _lookback_days: i64) -> Result<InteractionRecords> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(self.records.clone())
        }
    }

    #[derive(Default)]
    pub struct StaticMetadata {
        pub games: Vec<GameMetadata>,
        pub promotions: Vec<PromotionMetadata>,
    }

    #[async_trait]
    impl MetadataSource for StaticMetadata {
        async fn fetch_games(&self) -> Vec<GameMetadata> {
            self.games.clone()
        }

        async fn fetch_promotions(&self) -> Vec<PromotionMetadata> {
            self.promotions.clone()
        }
    }

    pub fn sample_metadata() -> StaticMetadata {
        StaticMetadata {
            games: sample_games(),
            promotions: sample_promotions(),
        }
    }

    pub fn service_with(
        checkpoint_dir: &Path,
        source: Arc<dyn InteractionSource>,
        vectors: Arc<InMemoryVectorStore>,
    ) -> MlService {
        MlService::new(
            test_config(checkpoint_dir),
            source,
            Arc::new(sample_metadata()),
            vectors,
        )
    }

    pub fn sample_service(checkpoint_dir: &Path) -> MlService {
        service_with(
            checkpoint_dir,
            Arc::new(StaticSource {
                records: sample_records(),
            }),
            Arc::new(InMemoryVectorStore::new()),
        )
    }
}
