use std::{path::PathBuf, time::Duration};
use chrono::Utc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::{
    config::{ExperimentConfig, Role},
    context::ExperimentContext,
    detector::{CompletionDetector, Phase},
    engine::{EngineError, SessionStatus, TransferEngine, TransferSession},
    event::TransferEvent,
    metrics::{MetricsEstimator, MetricsInput},
    monitor::EventMonitor,
    record::{now_timestamp, IterationResult, RunSummary, SizeCategory},
};

pub type Result<T> = std::result::Result<T, ExperimentError>;

#[derive(thiserror::Error, Debug)]
pub enum ExperimentError {

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("iteration {iteration} timed out after {elapsed:?} without receiving any data")]
    Timeout {
        iteration: u32,
        elapsed: Duration,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

}

#[derive(Debug, Clone, Default)]
pub struct RunReport {

    // Every iteration that completed and produced metrics, persisted or not.
    pub results: Vec<IterationResult>,

    pub summary: Option<RunSummary>,

    // Set when the run was interrupted before all iterations completed.
    pub cancelled: bool,

}

enum Exit {
    Finished(SessionStatus),
    TimedOut,
    Cancelled,
}

enum IterationOutcome {
    // None when metrics could not be computed.
    Completed(Option<IterationResult>),
    Cancelled,
}

// Drives one node through its iterations.
pub struct ExperimentController<E> {

    ctx: ExperimentContext,

    engine: E,

    cancel: CancellationToken,

    estimator: MetricsEstimator,

}

impl<E: TransferEngine> ExperimentController<E> {

    pub fn new(ctx: ExperimentContext, engine: E, cancel: CancellationToken) -> Self {
        let estimator = MetricsEstimator::new(ctx.config().peer_fanout);
        Self {
            ctx,
            engine,
            cancel,
            estimator,
        }
    }

    pub async fn run(&mut self) -> Result<RunReport> {
        let span = self.ctx.span().clone();
        self.run_role().instrument(span).await
    }

    async fn run_role(&mut self) -> Result<RunReport> {
        let config = self.ctx.config().clone();
        tracing::info!(
            "starting {} run of {} ({} iterations)",
            config.role,
            config.file_path.display(),
            config.iterations,
        );

        self.engine.preflight(config.role, &config.file_path).await?;
        match config.role {
            Role::Source => self.serve(&config).await,
            Role::Receiver => {
                let store = self.ctx.store().clone();
                tokio::task::spawn_blocking(move || store.check_destinations()).await?;
                self.receive(&config).await
            },
        }
    }

    // Seeds until cancelled.
    async fn serve(&mut self, config: &ExperimentConfig) -> Result<RunReport> {
        if self.cancel.is_cancelled() {
            tracing::info!("cancelled before seeding started");
            return Ok(RunReport {
                cancelled: true,
                ..Default::default()
            });
        }

        let mut session = self
            .engine
            .create_session(Role::Source, &config.file_path, &config.save_dir)
            .await?;
        let mut monitor = EventMonitor::new(Instant::now());
        let mut detector = CompletionDetector::new(&config.timing);
        let mut ticker = time::interval(config.timing.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("seeding, waiting for receivers");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            for event in session.poll_events() {
                monitor.observe(event);
            }
            let status = session.status();
            monitor.observe_counters(status.total_download, status.total_upload);

            if detector.reannounce_due(monitor.state(), Utc::now().timestamp()) {
                if let Err(e) = session.force_rediscovery().await {
                    tracing::warn!("re-announce failed: {}", e);
                }
            }
        }

        tracing::info!(
            "stopping, uploaded {} bytes to {} peers",
            monitor.state().uploaded(),
            monitor.state().peer_count(),
        );
        teardown(session).await;
        Ok(RunReport {
            cancelled: true,
            ..Default::default()
        })
    }

    async fn receive(&mut self, config: &ExperimentConfig) -> Result<RunReport> {
        let mut results = Vec::new();

        for iteration in 1..=config.iterations {
            // No new session once cancelled.
            if self.cancel.is_cancelled() {
                tracing::warn!("cancelled before iteration {}", iteration);
                return Ok(RunReport {
                    results,
                    summary: None,
                    cancelled: true,
                });
            }

            let span = tracing::info_span!(parent: self.ctx.span(), "iteration", n = iteration);
            tracing::info!("starting iteration {}/{}", iteration, config.iterations);

            match self.run_iteration(config, iteration).instrument(span.clone()).await? {
                IterationOutcome::Cancelled => {
                    tracing::warn!("cancelled during iteration {}, nothing recorded for it", iteration);
                    return Ok(RunReport {
                        results,
                        summary: None,
                        cancelled: true,
                    });
                },
                IterationOutcome::Completed(Some(result)) => {
                    self.persist(&result).instrument(span).await?;
                    results.push(result);
                },
                IterationOutcome::Completed(None) => {},
            }

            // The last download is left in place.
            if iteration < config.iterations {
                remove_download(config.downloaded_path()).await;
            }
        }

        let summary = self.summarise(&results).await?;
        Ok(RunReport {
            results,
            summary,
            cancelled: false,
        })
    }

    async fn run_iteration(&mut self, config: &ExperimentConfig, iteration: u32) -> Result<IterationOutcome> {
        let mut session = self
            .engine
            .create_session(Role::Receiver, &config.file_path, &config.save_dir)
            .await?;

        let start = Instant::now();
        let mut monitor = EventMonitor::new(start);
        let mut detector = CompletionDetector::new(&config.timing);
        let mut ticker = time::interval(config.timing.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Exit::Cancelled,
                _ = ticker.tick() => {},
            }

            let status = session.status();
            for event in session.poll_events() {
                monitor.observe(event);
            }
            monitor.observe(TransferEvent::ProgressChanged { fraction: status.progress });
            monitor.observe_counters(status.total_download, status.total_upload);

            match detector.evaluate(monitor.state_mut(), status.is_finished, Instant::now()) {
                Phase::Finished => break Exit::Finished(status),
                Phase::TimedOut => break Exit::TimedOut,
                Phase::Running => {},
            }

            if detector.reannounce_due(monitor.state(), Utc::now().timestamp()) {
                tracing::info!("forcing re-announce");
                if let Err(e) = session.force_rediscovery().await {
                    tracing::warn!("re-announce failed: {}", e);
                }
            }
        };

        let elapsed = start.elapsed();
        teardown(session).await;
        tracing::debug!(
            "peak rates: {} B/tick down, {} B/tick up, {} peers",
            monitor.state().peak_download_rate(),
            monitor.state().peak_upload_rate(),
            monitor.state().peer_count(),
        );

        match exit {
            Exit::Cancelled => Ok(IterationOutcome::Cancelled),
            Exit::TimedOut => {
                tracing::error!("timeout reached, no data received in {:?}", elapsed);
                Err(ExperimentError::Timeout { iteration, elapsed })
            },
            Exit::Finished(status) => {
                tracing::info!("download complete");
                let file_size = file_size(config.downloaded_path(), &status).await;
                let input = MetricsInput {
                    file_size,
                    transfer_time: elapsed,
                    uploaded: monitor.state().uploaded(),
                };

                let metrics = match self.estimator.estimate(input) {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        tracing::warn!("iteration {} not recorded: {}", iteration, e);
                        return Ok(IterationOutcome::Completed(None));
                    },
                };

                tracing::info!("transfer time: {:.2} seconds", metrics.transfer_time);
                tracing::info!("throughput: {:.2} kbps", metrics.throughput);
                tracing::info!("estimated total data transferred: {} bytes", metrics.estimated_total);
                tracing::info!("estimated transfer ratio: {:.4}", metrics.transfer_ratio);

                Ok(IterationOutcome::Completed(Some(IterationResult {
                    node_id: config.node_id.clone(),
                    transfer_time: metrics.transfer_time,
                    throughput: metrics.throughput,
                    file_size,
                    size_category: SizeCategory::of(file_size),
                    iteration,
                    total_data_transferred: metrics.estimated_total,
                    transfer_ratio: metrics.transfer_ratio,
                    timestamp: now_timestamp(),
                })))
            },
        }
    }

    // Store failures are logged, the result stays in memory.
    async fn persist(&self, result: &IterationResult) -> Result<()> {
        let store = self.ctx.store().clone();
        let record = result.clone();
        match tokio::task::spawn_blocking(move || store.append_iteration(&record)).await? {
            Ok(path) => tracing::debug!("iteration {} saved to {}", result.iteration, path.display()),
            Err(e) => tracing::warn!("failed to save iteration {}: {}", result.iteration, e),
        }
        Ok(())
    }

    async fn summarise(&self, results: &[IterationResult]) -> Result<Option<RunSummary>> {
        let Some(summary) = RunSummary::from_results(results) else {
            tracing::warn!("no iterations recorded, skipping summary");
            return Ok(None);
        };

        tracing::info!("final results over {} iterations:", results.len());
        tracing::info!("average transfer time: {:.2} seconds", summary.avg_transfer_time);
        tracing::info!("transfer time std dev: {:.2}", summary.std_dev_transfer_time);
        tracing::info!("average throughput: {:.2} kbps", summary.avg_throughput);
        tracing::info!("throughput std dev: {:.2}", summary.std_dev_throughput);
        tracing::info!("average transfer ratio: {:.4}", summary.avg_transfer_ratio);
        tracing::info!("transfer ratio std dev: {:.4}", summary.std_dev_transfer_ratio);

        let store = self.ctx.store().clone();
        let record = summary.clone();
        match tokio::task::spawn_blocking(move || store.append_summary(&record)).await? {
            Ok(path) => tracing::info!("final results saved to {}", path.display()),
            Err(e) => tracing::warn!("failed to save final results: {}", e),
        }
        Ok(Some(summary))
    }

}

// Sessions are always paused then destroyed, whatever ended the iteration.
async fn teardown(mut session: Box<dyn TransferSession>) {
    session.pause().await;
    session.destroy().await;
}

// Size of the file on disk, or the length the engine reported when it is missing.
async fn file_size(path: PathBuf, status: &SessionStatus) -> u64 {
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.len() > 0 => meta.len(),
        _ => status.total_len,
    }
}

async fn remove_download(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => tracing::debug!("removed {} for the next iteration", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => tracing::warn!("failed to remove {}: {}", path.display(), e),
    }
}
