// ============================================
// Vector store
// ============================================
//
// Embedding cache keyed by string ids, one collection per (engine, node
// type). The Qdrant client speaks the REST API; point ids are UUIDv5 of
// the string id, which is kept in the payload.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const ID_KEY: &str = "id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()>;

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Vec<f32>>>;

    async fn scroll(&self, collection: &str, limit: usize) -> Result<Vec<VectorPoint>>;
}

pub fn point_uuid(id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_bytes())
}

// ============================================
// Qdrant REST client
// ============================================

pub struct QdrantStore {
    http: HttpClient,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct QdrantPoint {
    id: Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ScrollResult {
    points: Vec<QdrantPoint>,
}

impl QdrantPoint {
    fn into_point(self) -> VectorPoint {
        let payload = self.payload.unwrap_or(Value::Null);
        let id = payload
            .get(ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.id.as_str().map(str::to_string))
            .unwrap_or_else(|| self.id.to_string());
        VectorPoint {
            id,
            vector: self.vector.unwrap_or_default(),
            payload,
        }
    }
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = HttpClient::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::VectorStore(format!("status {status}: {body}")))
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("/collections/{collection}")))
            .json(&json!({ "vectors": { "size": dim, "distance": "Cosine" } }))
            .send()
            .await?;
        // Existing collections answer with a conflict
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        check(response).await?;
        info!(collection, dim, "Created vector collection");
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let count = points.len();
        let body: Vec<Value> = points
            .into_iter()
            .map(|p| {
                let mut payload = match p.payload {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                payload.insert(ID_KEY.to_string(), Value::String(p.id.clone()));
                json!({
                    "id": point_uuid(&p.id).to_string(),
                    "vector": p.vector,
                    "payload": payload,
                })
            })
            .collect();

        let response = self
            .http
            .put(self.url(&format!("/collections/{collection}/points?wait=true")))
            .json(&json!({ "points": body }))
            .send()
            .await?;
        check(response).await?;
        debug!(collection, count, "Upserted vectors");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Vec<f32>>> {
        let response = self
            .http
            .post(self.url(&format!("/collections/{collection}/points")))
            .json(&json!({
                "ids": [point_uuid(id).to_string()],
                "with_vector": true,
                "with_payload": true,
            }))
            .send()
            .await?;
        let parsed: QdrantResponse<Vec<QdrantPoint>> = check(response).await?.json().await?;
        Ok(parsed
            .result
            .into_iter()
            .next()
            .and_then(|p| p.vector))
    }

    async fn scroll(&self, collection: &str, limit: usize) -> Result<Vec<VectorPoint>> {
        let response = self
            .http
            .post(self.url(&format!("/collections/{collection}/points/scroll")))
            .json(&json!({ "limit": limit, "with_vector": true, "with_payload": true }))
            .send()
            .await?;
        let parsed: QdrantResponse<ScrollResult> = check(response).await?.json().await?;
        Ok(parsed.result.points.into_iter().map(QdrantPoint::into_point).collect())
    }
}

// ============================================
// In-memory store
// ============================================

/// Process-local store for tests and runs without a vector database.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: DashMap<String, (usize, BTreeMap<String, VectorPoint>)>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.1.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()> {
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| (dim, BTreeMap::new()));
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| AppError::VectorStore(format!("collection '{collection}' not found")))?;
        let (dim, stored) = entry.value_mut();
        if let Some(bad) = points.iter().find(|p| p.vector.len() != *dim) {
            return Err(AppError::VectorStore(format!(
                "vector for '{}' has {} dims, collection expects {}",
                bad.id,
                bad.vector.len(),
                dim
            )));
        }
        for point in points {
            stored.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Vec<f32>>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.1.get(id).map(|p| p.vector.clone())))
    }

    async fn scroll(&self, collection: &str, limit: usize) -> Result<Vec<VectorPoint>> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.1.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: json!({ "source": "lightgcn" }),
        }
    }

    #[test]
    fn test_point_uuid_is_stable() {
        assert_eq!(point_uuid("user-1"), point_uuid("user-1"));
        assert_ne!(point_uuid("user-1"), point_uuid("user-2"));
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryVectorStore::new();
        store.ensure_collection("lightgcn_users", 2).await.unwrap();
        store
            .upsert("lightgcn_users", vec![point("a", vec![1.0, 0.0]), point("b", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.get("lightgcn_users", "a").await.unwrap(), Some(vec![1.0, 0.0]));
        assert_eq!(store.get("lightgcn_users", "zzz").await.unwrap(), None);
        assert_eq!(store.scroll("lightgcn_users", 1).await.unwrap().len(), 1);
        assert_eq!(store.len("lightgcn_users"), 2);
    }

    #[tokio::test]
    async fn test_in_memory_rejects_bad_writes() {
        let store = InMemoryVectorStore::new();
        assert!(store.upsert("missing", vec![point("a", vec![1.0])]).await.is_err());

        store.ensure_collection("c", 3).await.unwrap();
        assert!(store.upsert("c", vec![point("a", vec![1.0])]).await.is_err());
        assert!(store.is_empty("c"));
    }
}
