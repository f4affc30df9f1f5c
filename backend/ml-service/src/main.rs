use anyhow::Context;
use ml_service::clients::{CmsClient, InMemoryVectorStore, QdrantStore, VectorStore};
use ml_service::config::JobKind;
use ml_service::db::PgInteractionSource;
use ml_service::models::{TrainRequest, TrainingReport};
use ml_service::{Config, MlService};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn log_report(report: &TrainingReport) {
    info!(
        engine = report.engine.as_str(),
        status = ?report.status,
        epochs = report.epochs_run,
        final_loss = ?report.final_loss,
        best_loss = ?report.best_loss,
        users = report.num_users,
        items = report.num_items,
        edges = report.num_edges,
        resumed = report.resumed_from_checkpoint,
        checkpoint_saved = report.checkpoint_saved,
        users_synced = report.synced.users_written,
        items_synced = report.synced.items_written,
        sync_failures = report.synced.failures,
        "Training finished"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = Config::from_env().context("Failed to load config")?;
    init_tracing(&config.log_format);
    config.validate()?;

    info!(job = ?config.job, checkpoint_dir = %config.checkpoint_dir, "Starting ml-service");

    let interactions = PgInteractionSource::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let metadata = CmsClient::new(config.cms_url.clone()).context("Failed to build CMS client")?;
    let vectors: Arc<dyn VectorStore> = if config.vector_store_url.is_empty() {
        warn!("No vector store configured, embeddings stay in process");
        Arc::new(InMemoryVectorStore::new())
    } else {
        Arc::new(QdrantStore::new(config.vector_store_url.clone()).context("Failed to build vector store client")?)
    };

    let job = config.job;
    let service = MlService::new(config, Arc::new(interactions), Arc::new(metadata), vectors);

    let mut failed = false;
    let runs: &[JobKind] = match job {
        JobKind::All => &[JobKind::Lightgcn, JobKind::Tgn, JobKind::Hgt],
        JobKind::Lightgcn => &[JobKind::Lightgcn],
        JobKind::Tgn => &[JobKind::Tgn],
        JobKind::Hgt => &[JobKind::Hgt],
    };

    for run in runs {
        let request = TrainRequest::default();
        let result = match run {
            JobKind::Lightgcn => service.train_lightgcn(request).await,
            JobKind::Tgn => service.train_tgn(request).await,
            JobKind::Hgt | JobKind::All => service.train_hgt(request).await,
        };
        match result {
            Ok(report) => log_report(&report),
            Err(e) => {
                error!(job = ?run, error = %e, "Training failed");
                failed = true;
            }
        }
    }

    if failed {
        anyhow::bail!("one or more training jobs failed");
    }
    Ok(())
}
