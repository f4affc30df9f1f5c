// ============================================
// ML Service
// ============================================
//
// Owns the collaborators, the training gate and one slot per engine.
// Slots are replaced wholesale after a successful train or load; readers
// clone the `Arc` and never observe a half-updated model.

use crate::clients::{MetadataSource, VectorPoint, VectorStore};
use crate::config::Config;
use crate::db::InteractionSource;
use crate::error::{AppError, Result};
use crate::models::{
    EngineKind, EventKind, InteractionRecords, LoadStatus, LossHistory, ScoredItem, SyncReport,
    TrainRequest, TrainingReport, TrainingStatus,
};
use crate::services::checkpoint::{load_into, Checkpoint, CheckpointStore};
use crate::services::coordinator::TrainingGate;
use crate::services::embedding_sync::sync_embeddings;
use crate::services::graph::hetero::GraphStats;
use crate::services::graph::{
    BipartiteGraphBuilder, HeteroGraph, HeteroGraphBuilder, NodeIndex, NodeType, TemporalEdgeBuilder,
};
use crate::services::hgt::{GameFilter, HgtInference, HgtTrainer};
use crate::services::inference::EmbeddingTables;
use crate::services::lightgcn::{LightGcnInference, LightGcnTrainer};
use crate::services::sessions::{SessionAddOutcome, SessionContext, SessionService, SessionStats};
use crate::services::tgn::{TgnInference, TgnTrainer};
use crate::services::weighting::WeightPolicy;
use chrono::{DateTime, Utc};
use ndarray::Array1;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Node and edge counts of a loaded engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub num_users: usize,
    pub num_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub training_in_progress: bool,
    pub lightgcn: Option<EngineStatus>,
    pub tgn: Option<EngineStatus>,
    pub hgt: Option<GraphStats>,
    pub sessions: SessionStats,
}

/// What a blocking training run hands back to the async side.
struct TrainedEngine<I> {
    inference: I,
    tables: Arc<EmbeddingTables>,
    users: NodeIndex,
    items: NodeIndex,
    run: LossHistory,
    resumed: bool,
    saved: bool,
}

fn completed(
    engine: EngineKind,
    run: &LossHistory,
    counts: (usize, usize, usize),
    resumed: bool,
    saved: bool,
    synced: SyncReport,
) -> TrainingReport {
    let (num_users, num_items, num_edges) = counts;
    TrainingReport {
        engine,
        status: TrainingStatus::Completed,
        epochs_run: run.len(),
        final_loss: run.last(),
        best_loss: run.best(),
        losses: run.losses.clone(),
        num_users,
        num_items,
        num_edges,
        resumed_from_checkpoint: resumed,
        checkpoint_saved: saved,
        synced,
    }
}

fn save_or_warn(store: &CheckpointStore, checkpoint: &Checkpoint) -> bool {
    match store.save(checkpoint) {
        Ok(_) => true,
        Err(e) => {
            warn!(engine = checkpoint.engine.as_str(), error = %e, "Checkpoint save failed");
            false
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("training task failed: {e}")))?
}

pub struct MlService {
    config: Config,
    policy: WeightPolicy,
    interactions: Arc<dyn InteractionSource>,
    metadata: Arc<dyn MetadataSource>,
    vectors: Arc<dyn VectorStore>,
    checkpoints: CheckpointStore,
    gate: TrainingGate,
    lightgcn: RwLock<Option<Arc<LightGcnInference>>>,
    hgt: RwLock<Option<Arc<HgtInference>>>,
    sessions: SessionService,
}

impl MlService {
    pub fn new(
        config: Config,
        interactions: Arc<dyn InteractionSource>,
        metadata: Arc<dyn MetadataSource>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        let policy = WeightPolicy::new(config.weighting.clone());
        Self {
            checkpoints: CheckpointStore::new(config.checkpoint_dir.clone()),
            sessions: SessionService::new(config.session.clone(), policy.clone()),
            policy,
            interactions,
            metadata,
            vectors,
            gate: TrainingGate::new(),
            lightgcn: RwLock::new(None),
            hgt: RwLock::new(None),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    async fn fetch(&self, lookback_days: i64) -> Result<InteractionRecords> {
        self.interactions.fetch_interactions(lookback_days).await
    }

    async fn hetero_graph(&self, lookback_days: i64) -> Result<HeteroGraph> {
        let records = self.fetch(lookback_days).await?;
        let games = self.metadata.fetch_games().await;
        let promotions = self.metadata.fetch_promotions().await;
        Ok(HeteroGraphBuilder::new(self.policy.clone()).build(&records, &games, &promotions, Utc::now()))
    }

    // ============================================
    // Training
    // ============================================

    pub async fn train_lightgcn(&self, request: TrainRequest) -> Result<TrainingReport> {
        let _permit = self.gate.try_acquire()?;
        let config = self.config.lightgcn.clone();
        let lookback = request.lookback_days.unwrap_or(config.lookback_days);
        let records = self.fetch(lookback).await?;
        let graph = BipartiteGraphBuilder::new(self.policy.clone()).build(&records, Utc::now());
        if graph.is_empty() {
            info!("No positive interactions for LightGCN");
            return Ok(TrainingReport::no_data(EngineKind::LightGcn));
        }

        let counts = (graph.num_users(), graph.num_items(), graph.num_edges());
        let epochs = request.epochs.unwrap_or(config.epochs);
        let seed = self.config.seed;
        let checkpoints = self.checkpoints.clone();
        let force = request.force_retrain;

        let trained = blocking(move || {
            let mut trainer = LightGcnTrainer::new(config, &graph, seed);
            let resumed = !force
                && load_into(&checkpoints, EngineKind::LightGcn, |c| trainer.restore(c))
                    == LoadStatus::Loaded;
            let run = trainer.train(epochs);
            let saved = save_or_warn(&checkpoints, &trainer.checkpoint());

            let inference =
                LightGcnInference::new(trainer.into_model(), graph.users.clone(), graph.items.clone());
            let tables = inference.compute_embeddings()?;
            Ok(TrainedEngine {
                inference,
                tables,
                users: graph.users,
                items: graph.items,
                run,
                resumed,
                saved,
            })
        })
        .await?;

        *self.lightgcn.write() = Some(Arc::new(trained.inference));
        let synced = sync_embeddings(
            self.vectors.as_ref(),
            EngineKind::LightGcn,
            &trained.users,
            &trained.items,
            &trained.tables,
        )
        .await;
        Ok(completed(EngineKind::LightGcn, &trained.run, counts, trained.resumed, trained.saved, synced))
    }

    pub async fn train_tgn(&self, request: TrainRequest) -> Result<TrainingReport> {
        let _permit = self.gate.try_acquire()?;
        let config = self.config.tgn.clone();
        let lookback = request.lookback_days.unwrap_or(config.lookback_days);
        let records = self.fetch(lookback).await?;
        let graph = TemporalEdgeBuilder::new(self.policy.clone()).build(&records);
        if graph.is_empty() {
            info!("No temporal edges for TGN");
            return Ok(TrainingReport::no_data(EngineKind::Tgn));
        }

        let counts = (graph.num_users(), graph.num_items(), graph.edges.len());
        let epochs = request.epochs.unwrap_or(config.epochs);
        let seed = self.config.seed;
        let checkpoints = self.checkpoints.clone();
        let force = request.force_retrain;

        let trained = blocking(move || {
            let mut trainer = TgnTrainer::new(config, &graph, seed);
            let resumed = !force
                && load_into(&checkpoints, EngineKind::Tgn, |c| trainer.restore(c)) == LoadStatus::Loaded;
            let run = trainer.train(epochs);
            let saved = save_or_warn(&checkpoints, &trainer.checkpoint());

            let (model, memory) = trainer.into_parts();
            let inference = TgnInference::new(model, graph.users.clone(), graph.items.clone(), memory);
            let tables = inference.compute_embeddings()?;
            Ok(TrainedEngine {
                inference,
                tables,
                users: graph.users,
                items: graph.items,
                run,
                resumed,
                saved,
            })
        })
        .await?;

        self.sessions.install_engine(trained.inference);
        let synced = sync_embeddings(
            self.vectors.as_ref(),
            EngineKind::Tgn,
            &trained.users,
            &trained.items,
            &trained.tables,
        )
        .await;
        Ok(completed(EngineKind::Tgn, &trained.run, counts, trained.resumed, trained.saved, synced))
    }

    pub async fn train_hgt(&self, request: TrainRequest) -> Result<TrainingReport> {
        let _permit = self.gate.try_acquire()?;
        let config = self.config.hgt.clone();
        let lookback = request.lookback_days.unwrap_or(config.lookback_days);
        let graph = self.hetero_graph(lookback).await?;

        let counts = (
            graph.num_nodes(NodeType::User),
            graph.num_nodes(NodeType::Game),
            graph.total_edges(),
        );
        let epochs = request.epochs.unwrap_or(config.epochs);
        let seed = self.config.seed;
        let checkpoints = self.checkpoints.clone();
        let force = request.force_retrain;

        let trained = blocking(move || {
            let mut trainer = HgtTrainer::new(config, &graph, seed);
            if trainer.num_pairs() == 0 {
                return Ok(None);
            }
            let resumed = !force
                && load_into(&checkpoints, EngineKind::Hgt, |c| trainer.restore(c)) == LoadStatus::Loaded;
            let run = trainer.train(epochs);
            let saved = save_or_warn(&checkpoints, &trainer.checkpoint());

            let users = graph.index(NodeType::User).cloned().unwrap_or_default();
            let items = graph.index(NodeType::Game).cloned().unwrap_or_default();
            let inference = HgtInference::new(trainer.into_model(), graph);
            let tables = Arc::new(inference.compute_embeddings()?.tables());
            Ok(Some(TrainedEngine {
                inference,
                tables,
                users,
                items,
                run,
                resumed,
                saved,
            }))
        })
        .await?;

        let Some(trained) = trained else {
            info!("No user-game edges for HGT");
            return Ok(TrainingReport::no_data(EngineKind::Hgt));
        };

        *self.hgt.write() = Some(Arc::new(trained.inference));
        let synced = sync_embeddings(
            self.vectors.as_ref(),
            EngineKind::Hgt,
            &trained.users,
            &trained.items,
            &trained.tables,
        )
        .await;
        Ok(completed(EngineKind::Hgt, &trained.run, counts, trained.resumed, trained.saved, synced))
    }

    // ============================================
    // Checkpoint loading
    // ============================================

    /// Rebuilds the graph from current data and applies the saved model.
    /// On anything but `Loaded` the current slot is left as it was.
    pub async fn load_lightgcn_from_checkpoint(&self) -> Result<LoadStatus> {
        let _permit = self.gate.try_acquire()?;
        let config = self.config.lightgcn.clone();
        let records = self.fetch(config.lookback_days).await?;
        let graph = BipartiteGraphBuilder::new(self.policy.clone()).build(&records, Utc::now());
        let seed = self.config.seed;
        let checkpoints = self.checkpoints.clone();

        let (status, inference) = blocking(move || {
            let mut trainer = LightGcnTrainer::new(config, &graph, seed);
            let status = load_into(&checkpoints, EngineKind::LightGcn, |c| trainer.restore(c));
            if status != LoadStatus::Loaded {
                return Ok((status, None));
            }
            let inference = LightGcnInference::new(trainer.into_model(), graph.users, graph.items);
            match inference.compute_embeddings() {
                Ok(_) => Ok((status, Some(inference))),
                Err(e) => Ok((LoadStatus::Rejected(e.to_string()), None)),
            }
        })
        .await?;

        if let Some(inference) = inference {
            *self.lightgcn.write() = Some(Arc::new(inference));
        }
        Ok(status)
    }

    pub async fn load_tgn_from_checkpoint(&self) -> Result<LoadStatus> {
        let _permit = self.gate.try_acquire()?;
        let config = self.config.tgn.clone();
        let records = self.fetch(config.lookback_days).await?;
        let graph = TemporalEdgeBuilder::new(self.policy.clone()).build(&records);
        let seed = self.config.seed;
        let checkpoints = self.checkpoints.clone();

        let (status, inference) = blocking(move || {
            let mut trainer = TgnTrainer::new(config, &graph, seed);
            let status = load_into(&checkpoints, EngineKind::Tgn, |c| trainer.restore(c));
            if status != LoadStatus::Loaded {
                return Ok((status, None));
            }
            let (model, memory) = trainer.into_parts();
            let inference = TgnInference::new(model, graph.users, graph.items, memory);
            match inference.compute_embeddings() {
                Ok(_) => Ok((status, Some(inference))),
                Err(e) => Ok((LoadStatus::Rejected(e.to_string()), None)),
            }
        })
        .await?;

        if let Some(inference) = inference {
            self.sessions.install_engine(inference);
        }
        Ok(status)
    }

    pub async fn load_hgt_from_checkpoint(&self) -> Result<LoadStatus> {
        let _permit = self.gate.try_acquire()?;
        let config = self.config.hgt.clone();
        let graph = self.hetero_graph(config.lookback_days).await?;
        let seed = self.config.seed;
        let checkpoints = self.checkpoints.clone();

        let (status, inference) = blocking(move || {
            let mut trainer = HgtTrainer::new(config, &graph, seed);
            let status = load_into(&checkpoints, EngineKind::Hgt, |c| trainer.restore(c));
            if status != LoadStatus::Loaded {
                return Ok((status, None));
            }
            let inference = HgtInference::new(trainer.into_model(), graph);
            match inference.compute_embeddings() {
                Ok(_) => Ok((status, Some(inference))),
                Err(e) => Ok((LoadStatus::Rejected(e.to_string()), None)),
            }
        })
        .await?;

        if let Some(inference) = inference {
            *self.hgt.write() = Some(Arc::new(inference));
        }
        Ok(status)
    }

    pub fn training_status(&self) -> ServiceStatus {
        let lightgcn = self.lightgcn.read().as_ref().map(|m| EngineStatus {
            num_users: m.users().len(),
            num_items: m.items().len(),
        });
        let tgn = self.sessions.with_engine(|m| EngineStatus {
            num_users: m.users().len(),
            num_items: m.items().len(),
        });
        let hgt = self.hgt.read().as_ref().map(|m| m.graph_stats());
        ServiceStatus {
            training_in_progress: self.gate.is_busy(),
            lightgcn,
            tgn,
            hgt,
            sessions: self.sessions.stats(),
        }
    }

    // ============================================
    // LightGCN queries
    // ============================================

    fn lightgcn_model(&self) -> Result<Arc<LightGcnInference>> {
        self.lightgcn
            .read()
            .clone()
            .ok_or_else(|| AppError::NotComputed("LightGCN model not loaded".to_string()))
    }

    pub fn lightgcn_recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<ScoredItem>> {
        self.lightgcn_model()?.get_recommendations(user_id, top_k, exclude)
    }

    pub fn lightgcn_similar_games(&self, game_id: &str, top_k: usize) -> Result<Vec<ScoredItem>> {
        self.lightgcn_model()?.similar_games(game_id, top_k)
    }

    // ============================================
    // TGN sessions
    // ============================================

    pub fn session_add_interaction(
        &self,
        user_id: &str,
        game_id: &str,
        event_type: &str,
        duration_secs: Option<f64>,
        at: Option<DateTime<Utc>>,
    ) -> Result<SessionAddOutcome> {
        self.sessions.add_interaction(
            user_id,
            game_id,
            EventKind::parse(event_type),
            duration_secs,
            at.unwrap_or_else(Utc::now),
        )
    }

    pub fn session_recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<ScoredItem>> {
        self.sessions.recommendations(user_id, top_k, exclude, Utc::now())
    }

    pub fn session_context(&self, user_id: &str) -> Option<SessionContext> {
        self.sessions.session_context(user_id, Utc::now())
    }

    pub fn end_session(&self, user_id: &str) -> bool {
        self.sessions.end_session(user_id)
    }

    pub fn cleanup_expired_sessions(&self) -> usize {
        self.sessions.cleanup_expired_sessions(Utc::now())
    }

    pub fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    // ============================================
    // HGT queries
    // ============================================

    fn hgt_model(&self) -> Result<Arc<HgtInference>> {
        self.hgt
            .read()
            .clone()
            .ok_or_else(|| AppError::NotComputed("HGT model not loaded".to_string()))
    }

    pub fn hgt_recommendations(
        &self,
        user_id: &str,
        top_k: usize,
        exclude: &HashSet<String>,
        filter: &GameFilter,
    ) -> Result<Vec<ScoredItem>> {
        self.hgt_model()?.get_recommendations(user_id, top_k, exclude, filter)
    }

    pub fn hgt_similar_games(&self, game_id: &str, top_k: usize) -> Result<Vec<ScoredItem>> {
        self.hgt_model()?.similar_games(game_id, top_k)
    }

    pub fn hgt_provider_games(
        &self,
        provider_id: &str,
        user_id: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<ScoredItem>> {
        self.hgt_model()?.provider_games(provider_id, user_id, top_k)
    }

    pub fn hgt_cold_start_embedding(
        &self,
        node_type: NodeType,
        connections: &[(NodeType, String)],
    ) -> Result<Array1<f32>> {
        self.hgt_model()?.cold_start_embedding(node_type, connections)
    }

    pub fn hgt_graph_stats(&self) -> Result<GraphStats> {
        Ok(self.hgt_model()?.graph_stats())
    }

    // ============================================
    // Vector store reads
    // ============================================

    /// Stored user vector from the engine's collection. Store failures are
    /// logged and reported as absent.
    pub async fn stored_user_embedding(&self, engine: EngineKind, user_id: &str) -> Option<Vec<f32>> {
        match self.vectors.get(&engine.user_collection(), user_id).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(model = engine.as_str(), user_id, error = %e, "Vector read failed");
                None
            }
        }
    }

    pub async fn stored_game_embeddings(&self, engine: EngineKind, limit: usize) -> Vec<VectorPoint> {
        match self.vectors.scroll(&engine.item_collection(), limit).await {
            Ok(points) => points,
            Err(e) => {
                warn!(model = engine.as_str(), error = %e, "Vector scroll failed");
                Vec::new()
            }
        }
    }
}
