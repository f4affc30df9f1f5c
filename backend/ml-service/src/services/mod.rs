pub mod checkpoint;
pub mod coordinator;
pub mod embedding_sync;
pub mod graph;
pub mod hgt;
pub mod inference;
pub mod lightgcn;
pub mod ml_service;
pub mod sessions;
pub mod tgn;
pub mod weighting;

pub use checkpoint::{CheckpointStore, load_into};
pub use coordinator::{TrainingGate, TrainingPermit};
pub use ml_service::{EngineStatus, MlService, ServiceStatus};
pub use sessions::{SessionAddOutcome, SessionService};
pub use weighting::WeightPolicy;
