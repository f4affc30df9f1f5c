// ============================================
// Embedding sync
// ============================================
//
// Pushes freshly computed embeddings to the vector store. The store is an
// unreliable cache: failures are counted and logged, never raised.

use crate::clients::{VectorPoint, VectorStore};
use crate::models::{EngineKind, SyncReport};
use crate::services::graph::NodeIndex;
use crate::services::inference::EmbeddingTables;
use ndarray::Array2;
use serde_json::json;
use tracing::{info, warn};

const UPSERT_BATCH: usize = 100;

/// Writes every row of `table` to `collection`; returns rows written and
/// rows that failed.
async fn sync_table(
    store: &dyn VectorStore,
    engine: EngineKind,
    collection: &str,
    kind: &str,
    index: &NodeIndex,
    table: &Array2<f32>,
) -> (usize, usize) {
    let rows = index.len().min(table.nrows());
    if rows == 0 {
        return (0, 0);
    }
    if let Err(e) = store.ensure_collection(collection, table.ncols()).await {
        warn!(collection, error = %e, "Vector collection unavailable, skipping sync");
        return (0, rows);
    }

    let points: Vec<VectorPoint> = index
        .ids()
        .iter()
        .take(rows)
        .enumerate()
        .map(|(idx, id)| VectorPoint {
            id: id.clone(),
            vector: table.row(idx).to_vec(),
            payload: json!({ "index": idx, "kind": kind, "model": engine.as_str() }),
        })
        .collect();

    let mut written = 0;
    let mut failed = 0;
    for chunk in points.chunks(UPSERT_BATCH) {
        match store.upsert(collection, chunk.to_vec()).await {
            Ok(()) => written += chunk.len(),
            Err(e) => {
                warn!(collection, batch = chunk.len(), error = %e, "Vector upsert failed");
                failed += chunk.len();
            }
        }
    }
    (written, failed)
}

pub async fn sync_embeddings(
    store: &dyn VectorStore,
    engine: EngineKind,
    users: &NodeIndex,
    items: &NodeIndex,
    tables: &EmbeddingTables,
) -> SyncReport {
    let (users_written, user_failures) = sync_table(
        store,
        engine,
        &engine.user_collection(),
        "user",
        users,
        &tables.users,
    )
    .await;
    let (items_written, item_failures) = sync_table(
        store,
        engine,
        &engine.item_collection(),
        "game",
        items,
        &tables.items,
    )
    .await;

    let report = SyncReport {
        users_written,
        items_written,
        failures: user_failures + item_failures,
    };
    info!(
        model = engine.as_str(),
        users = report.users_written,
        games = report.items_written,
        failures = report.failures,
        "Embeddings synced"
    );
    report
}
