/// HTTP client tests against wiremock servers.
///
/// Coverage:
/// - CMS: games and promotions parsing, degradation to empty lists
/// - Qdrant: collection creation, upsert, point lookup, scroll, error mapping
#[cfg(test)]
mod tests {
    use ml_service::clients::vector_store::point_uuid;
    use ml_service::clients::{CmsClient, MetadataSource, QdrantStore, VectorPoint, VectorStore};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // ============================================
    // CMS
    // ============================================

    #[tokio::test]
    async fn test_cms_games_and_promotions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/games"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "docs": [
                    { "slug": "starburst", "provider": { "name": "netent" }, "badges": [{ "name": "popular" }] },
                    { "slug": "reactoonz", "provider": "playngo", "badges": ["new"] },
                    { "title": "no slug" }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/promotions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "docs": [
                    { "id": 12, "featuredGames": [{ "slug": "starburst" }, "reactoonz"] },
                    { "slug": "weekend" }
                ]
            })))
            .mount(&server)
            .await;

        let client = CmsClient::new(server.uri()).unwrap();

        let games = client.fetch_games().await;
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].provider.as_deref(), Some("netent"));
        assert_eq!(games[1].badges, vec!["new".to_string()]);

        let promotions = client.fetch_promotions().await;
        assert_eq!(promotions.len(), 2);
        assert_eq!(promotions[0].id, "12");
        assert_eq!(promotions[0].featured_games.len(), 2);
        assert_eq!(promotions[1].id, "weekend");
        assert!(promotions[1].featured_games.is_empty());
    }

    #[tokio::test]
    async fn test_cms_failure_degrades_to_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = CmsClient::new(server.uri()).unwrap();
        assert!(client.fetch_games().await.is_empty());
        assert!(client.fetch_promotions().await.is_empty());
    }

    // ============================================
    // Qdrant
    // ============================================

    #[tokio::test]
    async fn test_qdrant_existing_collection_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/lightgcn_users"))
            .and(body_partial_json(json!({ "vectors": { "size": 8, "distance": "Cosine" } })))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let store = QdrantStore::new(server.uri()).unwrap();
        store.ensure_collection("lightgcn_users", 8).await.unwrap();
    }

    #[tokio::test]
    async fn test_qdrant_upsert_uses_uuid_ids() {
        let server = MockServer::start().await;
        let uuid = point_uuid("alice").to_string();
        Mock::given(method("PUT"))
            .and(path("/collections/lightgcn_users/points"))
            .and(query_param("wait", "true"))
            .and(body_partial_json(json!({
                "points": [{ "id": uuid, "payload": { "id": "alice", "kind": "user" } }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": { "status": "completed" } })))
            .expect(1)
            .mount(&server)
            .await;

        let store = QdrantStore::new(server.uri()).unwrap();
        store
            .upsert(
                "lightgcn_users",
                vec![VectorPoint {
                    id: "alice".to_string(),
                    vector: vec![0.1, 0.2],
                    payload: json!({ "kind": "user" }),
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_qdrant_get_and_scroll() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/hgt_games/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{ "id": point_uuid("starburst").to_string(), "vector": [1.0, 0.0] }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/hgt_games/points/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "points": [
                        { "id": point_uuid("starburst").to_string(), "vector": [1.0, 0.0], "payload": { "id": "starburst" } },
                        { "id": 7, "vector": [0.0, 1.0] }
                    ],
                    "next_page_offset": null
                }
            })))
            .mount(&server)
            .await;

        let store = QdrantStore::new(server.uri()).unwrap();
        let vector = store.get("hgt_games", "starburst").await.unwrap();
        assert_eq!(vector, Some(vec![1.0, 0.0]));

        let points = store.scroll("hgt_games", 10).await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].id, "starburst");
        assert_eq!(points[1].id, "7");
    }

    #[tokio::test]
    async fn test_qdrant_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = QdrantStore::new(server.uri()).unwrap();
        let err = store.get("tgn_users", "alice").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
