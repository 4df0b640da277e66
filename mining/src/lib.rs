// Aegisum mining engine
//
// Core: sessions, energy, rewards, completion sweep
// Storage: PostgreSQL (durable), Redis (status cache + completion events)

pub mod api;
pub mod clock;
pub mod config;
pub mod energy;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod redis_backend;
pub mod reward;
pub mod scheduler;
pub mod session;
pub mod store;

/// Account identifier shared with the user service.
pub type UserId = i64;

pub use engine::{CleanupReport, EnergyStatus, MiningEngine, MiningStatus, StartReceipt, SweepReport};
pub use error::{MiningError, StorageError};
pub use store::{CompletionNotifier, MiningStore, StatusCache};
