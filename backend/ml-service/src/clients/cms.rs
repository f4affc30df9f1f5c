// ============================================
// CMS metadata client
// ============================================
//
// Reads games and promotions from the content service. Any failure
// degrades to empty lists so graph building can continue without metadata.

use crate::error::Result;
use crate::models::{GameMetadata, PromotionMetadata};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Never fails; unavailable metadata yields an empty list.
    async fn fetch_games(&self) -> Vec<GameMetadata>;

    async fn fetch_promotions(&self) -> Vec<PromotionMetadata>;
}

pub struct CmsClient {
    http: HttpClient,
    base_url: String,
}

impl CmsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_docs(&self, path: &str) -> Result<Vec<Value>> {
        let url = format!("{}{}", self.base_url, path);
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body
            .get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl MetadataSource for CmsClient {
    async fn fetch_games(&self) -> Vec<GameMetadata> {
        match self.fetch_docs("/api/games?limit=1000&depth=2").await {
            Ok(docs) => {
                let games: Vec<GameMetadata> = docs.iter().filter_map(parse_game).collect();
                debug!(games = games.len(), "Fetched CMS games");
                games
            }
            Err(e) => {
                warn!(error = %e, "CMS games unavailable, continuing without metadata");
                Vec::new()
            }
        }
    }

    async fn fetch_promotions(&self) -> Vec<PromotionMetadata> {
        match self.fetch_docs("/api/promotions?limit=100").await {
            Ok(docs) => docs.iter().filter_map(parse_promotion).collect(),
            Err(e) => {
                warn!(error = %e, "CMS promotions unavailable, continuing without metadata");
                Vec::new()
            }
        }
    }
}

/// A reference that is either a plain string or an object carrying `key`.
fn reference(value: &Value, key: &str) -> Option<String> {
    let name = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => match map.get(key)? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        },
        _ => return None,
    };
    (!name.is_empty()).then_some(name)
}

pub fn parse_game(doc: &Value) -> Option<GameMetadata> {
    let slug = reference(doc.get("slug")?, "slug")?;
    let provider = doc.get("provider").and_then(|p| reference(p, "name"));
    let badges = doc
        .get("badges")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(|b| reference(b, "name")).collect())
        .unwrap_or_default();
    Some(GameMetadata {
        slug,
        provider,
        badges,
    })
}

pub fn parse_promotion(doc: &Value) -> Option<PromotionMetadata> {
    let id = doc
        .get("id")
        .and_then(|v| reference(v, "id"))
        .or_else(|| doc.get("slug").and_then(|v| reference(v, "slug")))?;
    let featured_games = doc
        .get("featuredGames")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(|g| reference(g, "slug")).collect())
        .unwrap_or_default();
    Some(PromotionMetadata { id, featured_games })
}
