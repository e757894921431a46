use std::sync::Arc;
use crate::{config::ExperimentConfig, store::ResultStore};

// Everything a run needs besides the engine, handed to the controller once.
#[derive(Debug, Clone)]
pub struct ExperimentContext {

    config: Arc<ExperimentConfig>,

    store: ResultStore,

    // Parent of every iteration span.
    span: tracing::Span,

}

impl ExperimentContext {

    pub fn new(config: ExperimentConfig) -> Self {
        let store = ResultStore::new(config.result_dirs.clone());
        let span = tracing::info_span!(
            "experiment",
            node = %config.node_id,
            role = %config.role,
        );
        Self {
            config: Arc::new(config),
            store,
            span,
        }
    }

    pub fn config(&self) -> &Arc<ExperimentConfig> {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

}
