use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Which training job the binary runs before exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Lightgcn,
    Tgn,
    Hgt,
    All,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Relational event store
    pub database_url: String,

    // Content metadata service
    pub cms_url: String,

    // Embedding cache; empty means in-process store
    pub vector_store_url: String,

    pub checkpoint_dir: String,
    pub job: JobKind,
    pub seed: u64,

    // Observability
    pub log_format: String,

    pub weighting: WeightingConfig,
    pub lightgcn: LightGcnConfig,
    pub tgn: TgnConfig,
    pub hgt: HgtConfig,
    pub session: SessionConfig,
}

/// Interaction weighting constants shared by every graph builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingConfig {
    pub impression_weight: f64,
    pub click_weight: f64,
    pub play_weight: f64,
    pub rating_low_anchor: f64,
    pub rating_high_anchor: f64,
    pub review_sentiment_factor: f64,
    pub behavior_half_life_days: f64,
    pub rating_half_life_days: f64,
}

impl Default for WeightingConfig {
    fn default() -> Self {
        Self {
            impression_weight: 0.2,
            click_weight: 1.0,
            play_weight: 2.0,
            rating_low_anchor: -6.0,
            rating_high_anchor: 8.0,
            review_sentiment_factor: 0.5,
            behavior_half_life_days: 7.0,
            rating_half_life_days: 90.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightGcnConfig {
    pub embedding_dim: usize,
    pub num_layers: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub reg_weight: f32,
    pub lookback_days: i64,
}

impl Default for LightGcnConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 768,
            num_layers: 3,
            learning_rate: 0.001,
            batch_size: 1024,
            epochs: 100,
            reg_weight: 1e-4,
            lookback_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TgnConfig {
    pub embedding_dim: usize,
    pub memory_dim: usize,
    pub time_dim: usize,
    pub message_dim: usize,
    pub num_heads: usize,
    pub num_neighbors: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub grad_clip: f32,
    pub lookback_days: i64,
}

impl Default for TgnConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 768,
            memory_dim: 768,
            time_dim: 64,
            message_dim: 256,
            num_heads: 8,
            num_neighbors: 10,
            learning_rate: 0.001,
            batch_size: 256,
            epochs: 50,
            grad_clip: 1.0,
            lookback_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HgtConfig {
    pub hidden_dim: usize,
    pub embedding_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub reg_weight: f32,
    pub grad_clip: f32,
    pub lookback_days: i64,
}

impl Default for HgtConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 256,
            embedding_dim: 768,
            num_heads: 8,
            num_layers: 2,
            learning_rate: 0.001,
            batch_size: 1024,
            epochs: 100,
            reg_weight: 1e-4,
            grad_clip: 1.0,
            lookback_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub timeout_secs: u64,
    /// Most recent session items excluded from session recommendations
    pub recent_exclusion: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            recent_exclusion: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("database_url", "postgres://localhost/recommendation")?
            .set_default("cms_url", "http://localhost:3000")?
            .set_default("vector_store_url", "")?
            .set_default("checkpoint_dir", "./checkpoints")?
            .set_default("job", "all")?
            .set_default("seed", 42)?
            .set_default("log_format", "text")?
            // Weighting
            .set_default("weighting.impression_weight", 0.2)?
            .set_default("weighting.click_weight", 1.0)?
            .set_default("weighting.play_weight", 2.0)?
            .set_default("weighting.rating_low_anchor", -6.0)?
            .set_default("weighting.rating_high_anchor", 8.0)?
            .set_default("weighting.review_sentiment_factor", 0.5)?
            .set_default("weighting.behavior_half_life_days", 7.0)?
            .set_default("weighting.rating_half_life_days", 90.0)?
            // LightGCN
            .set_default("lightgcn.embedding_dim", 768)?
            .set_default("lightgcn.num_layers", 3)?
            .set_default("lightgcn.learning_rate", 0.001)?
            .set_default("lightgcn.batch_size", 1024)?
            .set_default("lightgcn.epochs", 100)?
            .set_default("lightgcn.reg_weight", 1e-4)?
            .set_default("lightgcn.lookback_days", 90)?
            // TGN
            .set_default("tgn.embedding_dim", 768)?
            .set_default("tgn.memory_dim", 768)?
            .set_default("tgn.time_dim", 64)?
            .set_default("tgn.message_dim", 256)?
            .set_default("tgn.num_heads", 8)?
            .set_default("tgn.num_neighbors", 10)?
            .set_default("tgn.learning_rate", 0.001)?
            .set_default("tgn.batch_size", 256)?
            .set_default("tgn.epochs", 50)?
            .set_default("tgn.grad_clip", 1.0)?
            .set_default("tgn.lookback_days", 90)?
            // HGT
            .set_default("hgt.hidden_dim", 256)?
            .set_default("hgt.embedding_dim", 768)?
            .set_default("hgt.num_heads", 8)?
            .set_default("hgt.num_layers", 2)?
            .set_default("hgt.learning_rate", 0.001)?
            .set_default("hgt.batch_size", 1024)?
            .set_default("hgt.epochs", 100)?
            .set_default("hgt.reg_weight", 1e-4)?
            .set_default("hgt.grad_clip", 1.0)?
            .set_default("hgt.lookback_days", 90)?
            // Sessions
            .set_default("session.timeout_secs", 1800)? // 30 minutes
            .set_default("session.recent_exclusion", 5)?
            .add_source(
                config::Environment::with_prefix("ML")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(anyhow!("Database URL is required"));
        }

        if self.weighting.behavior_half_life_days <= 0.0 || self.weighting.rating_half_life_days <= 0.0
        {
            return Err(anyhow!("Decay half-lives must be positive"));
        }

        if self.lightgcn.embedding_dim == 0 || self.lightgcn.batch_size == 0 {
            return Err(anyhow!("LightGCN embedding dim and batch size must be > 0"));
        }

        let tgn = &self.tgn;
        if tgn.embedding_dim == 0 || tgn.memory_dim == 0 || tgn.message_dim == 0 {
            return Err(anyhow!("TGN dimensions must be > 0"));
        }
        if tgn.time_dim == 0 || tgn.time_dim % 2 != 0 {
            return Err(anyhow!("TGN time_dim must be a positive even number"));
        }
        if tgn.num_heads == 0 || tgn.embedding_dim % tgn.num_heads != 0 {
            return Err(anyhow!("TGN embedding_dim must be divisible by num_heads"));
        }
        if tgn.num_neighbors == 0 || tgn.batch_size == 0 {
            return Err(anyhow!("TGN num_neighbors and batch size must be > 0"));
        }

        let hgt = &self.hgt;
        if hgt.hidden_dim == 0 || hgt.embedding_dim == 0 || hgt.batch_size == 0 {
            return Err(anyhow!("HGT dimensions and batch size must be > 0"));
        }
        if hgt.num_heads == 0 || hgt.hidden_dim % hgt.num_heads != 0 {
            return Err(anyhow!("HGT hidden_dim must be divisible by num_heads"));
        }

        if self.session.timeout_secs == 0 {
            return Err(anyhow!("Session timeout must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".to_string(),
            cms_url: "http://localhost:3000".to_string(),
            vector_store_url: String::new(),
            checkpoint_dir: "/tmp/checkpoints".to_string(),
            job: JobKind::All,
            seed: 7,
            log_format: "text".to_string(),
            weighting: WeightingConfig::default(),
            lightgcn: LightGcnConfig::default(),
            tgn: TgnConfig::default(),
            hgt: HgtConfig::default(),
            session: SessionConfig::default(),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_heads_must_divide_width() {
        let mut config = test_config();
        config.hgt.num_heads = 7;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.tgn.num_heads = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_odd_time_dim_rejected() {
        let mut config = test_config();
        config.tgn.time_dim = 63;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_half_life() {
        let mut config = test_config();
        config.weighting.rating_half_life_days = 0.0;
        assert!(config.validate().is_err());
    }
}
