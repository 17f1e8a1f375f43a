pub mod config;
pub mod error;
pub mod layers;
pub mod models;

pub use config::{FusionConfig, ModelConfig};
pub use error::FlamingoError;
