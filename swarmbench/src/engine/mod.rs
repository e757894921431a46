use std::{io, path::{Path, PathBuf}, time::Duration};
use tokio::net::TcpStream;
use crate::{config::Role, event::TransferEvent};

pub mod http;
pub use http::{HttpEngine, Protocol};

pub type Result<T> = std::result::Result<T, EngineError>;

pub const TRACKER_HOST_ENV: &str = "TRACKER_HOST";
pub const TRACKER_PORT_ENV: &str = "TRACKER_PORT";
pub const DEFAULT_TRACKER_HOST: &str = "localhost";
pub const DEFAULT_TRACKER_PORT: u16 = 6969;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum EngineError {

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("cannot connect to {addr}: {source}")]
    ConnectionRefused {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response status: {0}")]
    Status(u16),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

}

// Snapshot of a session's counters, all totals are absolute.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStatus {

    // Completion fraction in [0, 1].
    pub progress: f64,

    // Bytes received, including protocol overhead.
    pub total_download: u64,

    // Bytes sent.
    pub total_upload: u64,

    // Length of the file being transferred, 0 while unknown.
    pub total_len: u64,

    pub is_finished: bool,

}

// A transfer implementation the controller can drive.
#[async_trait::async_trait]
pub trait TransferEngine: Send + Sync {

    // Checks run once before any session is created. Failures are fatal to the run.
    async fn preflight(&self, _role: Role, _file: &Path) -> Result<()> {
        Ok(())
    }

    async fn create_session(
        &self,
        role: Role,
        file: &Path,
        save_dir: &Path,
    ) -> Result<Box<dyn TransferSession>>;

}

// One transfer of one file. Created and destroyed once per iteration.
#[async_trait::async_trait]
pub trait TransferSession: Send {

    fn status(&self) -> SessionStatus;

    // Drains events buffered since the last call, in arrival order.
    fn poll_events(&mut self) -> Vec<TransferEvent>;

    // Asks the engine to look for peers again.
    async fn force_rediscovery(&mut self) -> Result<()>;

    async fn pause(&mut self);

    async fn destroy(self: Box<Self>);

}

// Checks the coordination endpoint accepts TCP connections.
pub async fn check_tracker(host: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => {
            tracing::info!("tracker connection successful: {}", addr);
            Ok(())
        },
        Ok(Err(source)) => Err(EngineError::ConnectionRefused { addr, source }),
        Err(_) => Err(EngineError::Timeout(addr)),
    }
}
