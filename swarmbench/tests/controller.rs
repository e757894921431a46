use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use swarmbench::{
    engine::Result as EngineResult,
    store::{iteration_file_name, read_records, SUMMARY_FILE_NAME},
    table::Record,
    EngineError, ExperimentConfig, ExperimentError, IterationResult, Role, RunSummary, SessionStatus,
    SizeCategory, TransferEngine, TransferEvent, TransferSession,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const NODE_ID: &str = "leecher-test";
const FILE_LEN: u64 = 10240;

// How a scripted session behaves, in seconds since it was created.
#[derive(Debug, Clone, Copy)]
struct Plan {
    finish_after: Option<u64>,
    bytes_per_sec: u64,
    total_len: u64,
    uploaded: u64,
}

impl Plan {
    fn finishing_after(secs: u64) -> Self {
        Self { finish_after: Some(secs), bytes_per_sec: FILE_LEN, total_len: FILE_LEN, uploaded: 5120 }
    }

    fn stalled() -> Self {
        Self { finish_after: None, bytes_per_sec: 0, total_len: FILE_LEN, uploaded: 0 }
    }

    fn trickling() -> Self {
        Self { finish_after: None, bytes_per_sec: 1, total_len: FILE_LEN, uploaded: 0 }
    }
}

#[derive(Debug, Default)]
struct Counts {
    created: AtomicUsize,
    paused: AtomicUsize,
    destroyed: AtomicUsize,
}

struct MockEngine {
    plans: Mutex<VecDeque<Plan>>,
    fallback: Plan,
    counts: Arc<Counts>,
    fail_preflight: bool,
}

impl MockEngine {
    fn new(plans: impl IntoIterator<Item = Plan>, fallback: Plan) -> (Self, Arc<Counts>) {
        let counts = Arc::new(Counts::default());
        let engine = Self {
            plans: Mutex::new(plans.into_iter().collect()),
            fallback,
            counts: counts.clone(),
            fail_preflight: false,
        };
        (engine, counts)
    }
}

#[async_trait::async_trait]
impl TransferEngine for MockEngine {

    async fn preflight(&self, _role: Role, file: &Path) -> EngineResult<()> {
        if self.fail_preflight {
            return Err(EngineError::FileNotFound(file.to_path_buf()));
        }
        Ok(())
    }

    async fn create_session(
        &self,
        _role: Role,
        _file: &Path,
        _save_dir: &Path,
    ) -> EngineResult<Box<dyn TransferSession>> {
        self.counts.created.fetch_add(1, Ordering::SeqCst);
        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(self.fallback);
        Ok(Box::new(MockSession {
            plan,
            created: Instant::now(),
            counts: self.counts.clone(),
            announced_peer: false,
        }))
    }

}

struct MockSession {
    plan: Plan,
    created: Instant,
    counts: Arc<Counts>,
    announced_peer: bool,
}

#[async_trait::async_trait]
impl TransferSession for MockSession {

    fn status(&self) -> SessionStatus {
        let secs = self.created.elapsed().as_secs();
        let plan = self.plan;
        match plan.finish_after {
            Some(after) if secs >= after => SessionStatus {
                progress: 1.0,
                total_download: plan.total_len,
                total_upload: plan.uploaded,
                total_len: plan.total_len,
                is_finished: true,
            },
            _ => {
                let downloaded = (secs * plan.bytes_per_sec).min(plan.total_len);
                SessionStatus {
                    progress: downloaded as f64 / plan.total_len.max(1) as f64,
                    total_download: downloaded,
                    total_upload: 0,
                    total_len: plan.total_len,
                    is_finished: false,
                }
            },
        }
    }

    fn poll_events(&mut self) -> Vec<TransferEvent> {
        if self.announced_peer {
            return Vec::new();
        }
        self.announced_peer = true;
        let address: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        vec![TransferEvent::PeerConnected { address }]
    }

    async fn force_rediscovery(&mut self) -> EngineResult<()> {
        Ok(())
    }

    async fn pause(&mut self) {
        self.counts.paused.fetch_add(1, Ordering::SeqCst);
    }

    async fn destroy(self: Box<Self>) {
        self.counts.destroyed.fetch_add(1, Ordering::SeqCst);
    }

}

fn config(result_dirs: Vec<PathBuf>, save_dir: &Path, iterations: u32) -> ExperimentConfig {
    let mut config = ExperimentConfig::new(Role::Receiver, PathBuf::from("A_10kB"), save_dir.to_path_buf(), iterations);
    config.node_id = NODE_ID.into();
    config.result_dirs = result_dirs;
    config
}

fn read_rows<R: Record>(path: &Path) -> anyhow::Result<Vec<R>> {
    Ok(read_records(path)?)
}

fn iteration_file(dir: &Path) -> PathBuf {
    dir.join(iteration_file_name(SizeCategory::Small, NODE_ID))
}

#[tokio::test(start_paused = true)]
async fn test_three_iterations_three_rows_one_summary() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let plans = [Plan::finishing_after(1), Plan::finishing_after(2), Plan::finishing_after(4)];
    let (engine, counts) = MockEngine::new(plans, Plan::stalled());

    let report = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 3),
        engine,
        CancellationToken::new(),
    ).await?;

    assert!(!report.cancelled);
    assert_eq!(report.results.len(), 3);
    assert_eq!(counts.created.load(Ordering::SeqCst), 3);
    assert_eq!(counts.paused.load(Ordering::SeqCst), 3);
    assert_eq!(counts.destroyed.load(Ordering::SeqCst), 3);

    let times: Vec<f64> = report.results.iter().map(|r| r.transfer_time).collect();
    assert_eq!(times, vec![1.0, 2.0, 4.0]);
    for result in &report.results {
        assert_eq!(result.total_data_transferred, 76800);
        assert_eq!(result.transfer_ratio, 2.5);
        assert_eq!(result.file_size, FILE_LEN);
    }

    let rows: Vec<IterationResult> = read_rows(&iteration_file(results.path()))?;
    assert_eq!(rows, report.results);
    assert_eq!(rows.iter().map(|r| r.iteration).collect::<Vec<_>>(), vec![1, 2, 3]);

    let summaries: Vec<RunSummary> = read_rows(&results.path().join(SUMMARY_FILE_NAME))?;
    assert_eq!(summaries.len(), 1);
    let mean_throughput = rows.iter().map(|r| r.throughput).sum::<f64>() / rows.len() as f64;
    assert_eq!(summaries[0].avg_throughput, mean_throughput);
    assert_eq!(report.summary.as_ref(), Some(&summaries[0]));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_stops_run() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let (engine, counts) = MockEngine::new([Plan::finishing_after(1)], Plan::stalled());

    let err = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 3),
        engine,
        CancellationToken::new(),
    ).await.unwrap_err();

    match err {
        ExperimentError::Timeout { iteration, elapsed } => {
            assert_eq!(iteration, 2);
            assert!(elapsed > Duration::from_secs(30));
        },
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(counts.created.load(Ordering::SeqCst), 2);
    assert_eq!(counts.destroyed.load(Ordering::SeqCst), 2);

    // The first iteration's record survives, no summary is written.
    let rows: Vec<IterationResult> = read_rows(&iteration_file(results.path()))?;
    assert_eq!(rows.len(), 1);
    assert!(!results.path().join(SUMMARY_FILE_NAME).exists());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_transfer_is_not_a_timeout() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let slow = Plan { finish_after: Some(90), bytes_per_sec: 1, total_len: FILE_LEN, uploaded: 0 };
    let (engine, _) = MockEngine::new([slow], Plan::stalled());

    let report = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 1),
        engine,
        CancellationToken::new(),
    ).await?;
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].transfer_time, 90.0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_tears_down_without_record() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let (engine, counts) = MockEngine::new([], Plan::trickling());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let report = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 3),
        engine,
        cancel,
    ).await?;

    assert!(report.cancelled);
    assert!(report.results.is_empty());
    assert!(report.summary.is_none());
    assert_eq!(counts.created.load(Ordering::SeqCst), 1);
    assert_eq!(counts.paused.load(Ordering::SeqCst), 1);
    assert_eq!(counts.destroyed.load(Ordering::SeqCst), 1);
    assert!(!iteration_file(results.path()).exists());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_opens_no_session() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let instant = [Plan::finishing_after(0), Plan::finishing_after(0), Plan::finishing_after(0)];
    let (engine, counts) = MockEngine::new(instant, Plan::finishing_after(0));
    let report = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 3),
        engine,
        cancel.clone(),
    ).await?;

    assert!(report.cancelled);
    assert!(report.results.is_empty());
    assert!(report.summary.is_none());
    assert_eq!(counts.created.load(Ordering::SeqCst), 0);
    assert!(!iteration_file(results.path()).exists());
    assert!(!results.path().join(SUMMARY_FILE_NAME).exists());

    // Seeding does not start either.
    let (engine, counts) = MockEngine::new([], Plan::stalled());
    let mut source = config(vec![results.path().to_path_buf()], save.path(), 1);
    source.role = Role::Source;
    let report = swarmbench::run_experiment(source, engine, cancel).await?;
    assert!(report.cancelled);
    assert_eq!(counts.created.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_first_writable_destination_wins() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let unwritable = root.path().join("not-mounted");
    let second = root.path().join("data");
    let third = root.path().join("cwd");
    std::fs::create_dir(&second)?;
    std::fs::create_dir(&third)?;

    let (engine, _) = MockEngine::new([], Plan::finishing_after(1));
    swarmbench::run_experiment(
        config(vec![unwritable.clone(), second.clone(), third.clone()], save.path(), 1),
        engine,
        CancellationToken::new(),
    ).await?;

    assert!(!unwritable.exists());
    assert!(iteration_file(&second).exists());
    assert!(second.join(SUMMARY_FILE_NAME).exists());
    assert!(!iteration_file(&third).exists());
    Ok(())
}

// /proc/self is an existing directory that rejects new files, even for root.
#[cfg(target_os = "linux")]
#[tokio::test(start_paused = true)]
async fn test_existing_unwritable_destination_skipped() -> anyhow::Result<()> {
    let root = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let unwritable = PathBuf::from("/proc/self");
    let second = root.path().join("data");
    let third = root.path().join("cwd");
    std::fs::create_dir(&second)?;
    std::fs::create_dir(&third)?;
    assert!(unwritable.is_dir());

    let (engine, _) = MockEngine::new([], Plan::finishing_after(1));
    let report = swarmbench::run_experiment(
        config(vec![unwritable.clone(), second.clone(), third.clone()], save.path(), 1),
        engine,
        CancellationToken::new(),
    ).await?;

    assert!(!iteration_file(&unwritable).exists());
    assert!(!unwritable.join(SUMMARY_FILE_NAME).exists());
    let rows: Vec<IterationResult> = read_rows(&iteration_file(&second))?;
    assert_eq!(rows, report.results);
    assert!(second.join(SUMMARY_FILE_NAME).exists());
    assert_eq!(std::fs::read_dir(&third)?.count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_keeps_results_in_memory() -> anyhow::Result<()> {
    let save = tempfile::tempdir()?;
    let (engine, _) = MockEngine::new([], Plan::finishing_after(2));

    let report = swarmbench::run_experiment(
        config(vec![PathBuf::from("/nonexistent/swarmbench")], save.path(), 2),
        engine,
        CancellationToken::new(),
    ).await?;

    assert_eq!(report.results.len(), 2);
    assert!(report.summary.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unmeasurable_iteration_is_skipped() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let empty = Plan { finish_after: Some(1), bytes_per_sec: 0, total_len: 0, uploaded: 0 };
    let (engine, counts) = MockEngine::new([empty], Plan::finishing_after(1));

    let report = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 2),
        engine,
        CancellationToken::new(),
    ).await?;

    assert_eq!(counts.created.load(Ordering::SeqCst), 2);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].iteration, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_preflight_failure_is_fatal() -> anyhow::Result<()> {
    let results = tempfile::tempdir()?;
    let save = tempfile::tempdir()?;
    let (mut engine, counts) = MockEngine::new([], Plan::finishing_after(1));
    engine.fail_preflight = true;

    let err = swarmbench::run_experiment(
        config(vec![results.path().to_path_buf()], save.path(), 1),
        engine,
        CancellationToken::new(),
    ).await.unwrap_err();

    assert!(matches!(err, ExperimentError::Engine(EngineError::FileNotFound(_))));
    assert_eq!(counts.created.load(Ordering::SeqCst), 0);
    Ok(())
}
