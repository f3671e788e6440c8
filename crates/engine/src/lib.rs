pub mod ledger;
pub mod live;
pub mod orchestrator;
pub mod summary;

pub use ledger::Ledger;
pub use live::{run_live, LiveRunConfig};
pub use orchestrator::{run_batch, BatchRunConfig, EngineError};
pub use summary::RunSummary;
