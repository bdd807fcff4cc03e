pub mod backoff;
pub mod engine;
pub mod queue;

pub use backoff::Backoff;
pub use engine::{DEFAULT_MAX_ATTEMPTS, EngineError, SyncEngine, SyncReport};
