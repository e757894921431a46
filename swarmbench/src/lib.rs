use tokio_util::sync::CancellationToken;

pub mod config;
pub mod context;
pub mod event;
pub mod monitor;
pub mod detector;
pub mod metrics;
pub mod record;
pub mod table;
pub mod store;
pub mod aggregate;
pub mod controller;
pub mod engine;
pub mod stats;

// Unit of completion tracking, 16 KiB pieces.
const BLOCK_SIZE: u64 = 0x4000;

// Re-exports
pub use config::{ExperimentConfig, Role, Timing};
pub use context::ExperimentContext;
pub use controller::{ExperimentController, ExperimentError, RunReport};
pub use engine::{EngineError, SessionStatus, TransferEngine, TransferSession};
pub use event::TransferEvent;
pub use record::{IterationResult, RunSummary, SizeCategory};
pub use store::{ResultStore, StoreError};
pub use aggregate::{AggregationPipeline, AggregateReport};

// Runs one experiment to completion with the given engine.
// The token can be cancelled at any point to abandon the current iteration.
pub async fn run_experiment<E: TransferEngine>(
    config: ExperimentConfig,
    engine: E,
    cancel: CancellationToken,
) -> controller::Result<RunReport> {
    let ctx = ExperimentContext::new(config);
    let mut controller = ExperimentController::new(ctx, engine, cancel);
    controller.run().await
}
