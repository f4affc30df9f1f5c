pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod nn;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{AppError, Result};
pub use services::MlService;
