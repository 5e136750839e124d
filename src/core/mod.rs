// Shared infrastructure used by the coordinator and the state stores

pub mod config;
pub mod errors;

pub use config::{CoordinatorConfig, CoordinatorConfigBuilder};
pub use errors::{BoardError, Result};
