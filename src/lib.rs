pub mod config;
pub mod core;
pub mod data_utils;
pub mod error;
pub mod llm;

pub use config::FusionConfig;
pub use crate::core::fusion::{
    CalculationType, FusionOutput, FusionPipeline, FusionRequest, FusionStrategy, QueryIntent,
    QueryLevel,
};
pub use error::{FusionError, Result};
