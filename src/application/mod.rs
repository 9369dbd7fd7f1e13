// Application layer: the saga orchestrator and its error taxonomy.
// Callers (CLI, HTTP, ...) only talk to `SagaOrchestrator`.

pub mod config;
pub mod error;
pub mod orchestrator;
mod reconcile;

pub use config::*;
pub use error::*;
pub use orchestrator::*;
