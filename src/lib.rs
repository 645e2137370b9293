// Library interface for RepCoach modules
// This allows integration tests and the CLI to share the engine

pub mod aggregator;
pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod rescore;
pub mod scoring;
pub mod store;
pub mod suggestion;

// Re-export commonly used types for convenience
pub use aggregator::{FinalizedSet, SetAggregator, StartedSet};
pub use api::{ApiResponse, Operation, RepCoachService};
pub use config::AppConfig;
pub use error::{ErrorCategory, NotFoundError, RepCoachError, Result};
pub use logging::{LogConfig, LogFormat, LogLevel};
pub use models::*;
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoreError};
