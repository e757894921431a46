// Plain HTTP transfer engine.
//
// The source serves the file over HTTP/1.1 and HTTP/2 (detected per
// connection), receivers fetch it from the coordination endpoint with the
// configured protocol. Header bytes are counted as downloaded so the overhead
// of each protocol shows up in the results.

use std::{
    convert::Infallible,
    fmt,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;
use crate::{config::Role, event::TransferEvent, BLOCK_SIZE};
use super::{check_tracker, EngineError, Result, SessionStatus, TransferEngine, TransferSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http1,
    // Prior knowledge, no upgrade.
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "http1"),
            Protocol::Http2 => write!(f, "http2"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpEngine {

    protocol: Protocol,

    // Where receivers fetch from.
    tracker_host: String,

    tracker_port: u16,

    // Where the source listens.
    listen: SocketAddr,

}

impl HttpEngine {

    pub fn new(protocol: Protocol, tracker_host: impl Into<String>, tracker_port: u16, listen: SocketAddr) -> Self {
        Self {
            protocol,
            tracker_host: tracker_host.into(),
            tracker_port,
            listen,
        }
    }

    fn client(&self) -> Result<reqwest::Client> {
        let builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        let builder = match self.protocol {
            Protocol::Http1 => builder.http1_only(),
            Protocol::Http2 => builder.http2_prior_knowledge(),
        };
        Ok(builder.build()?)
    }

    fn file_url(&self, name: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("http://{}:{}/", self.tracker_host, self.tracker_port))?;
        url.path_segments_mut()
            .map_err(|_| EngineError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

}

#[async_trait::async_trait]
impl TransferEngine for HttpEngine {

    async fn preflight(&self, role: Role, file: &Path) -> Result<()> {
        match role {
            Role::Source => {
                if !file.is_file() {
                    return Err(EngineError::FileNotFound(file.to_path_buf()));
                }
                Ok(())
            },
            Role::Receiver => check_tracker(&self.tracker_host, self.tracker_port).await,
        }
    }

    async fn create_session(
        &self,
        role: Role,
        file: &Path,
        save_dir: &Path,
    ) -> Result<Box<dyn TransferSession>> {
        match role {
            Role::Source => Ok(Box::new(SourceSession::start(self.listen, file).await?)),
            Role::Receiver => {
                let name = file_name(file);
                tokio::fs::create_dir_all(save_dir).await?;
                let url = self.file_url(&name)?;
                tracing::info!("fetching {} over {}", url, self.protocol);
                Ok(Box::new(ReceiverSession::start(self.client()?, url, save_dir.join(name))))
            },
        }
    }

}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

struct ServedFile {
    name: String,
    data: Bytes,
}

pub struct SourceSession {

    file: Arc<ServedFile>,

    local_addr: SocketAddr,

    uploaded: Arc<AtomicU64>,

    events_tx: mpsc::UnboundedSender<TransferEvent>,

    events_rx: mpsc::UnboundedReceiver<TransferEvent>,

    cancel: CancellationToken,

    server: JoinHandle<()>,

}

impl SourceSession {

    async fn start(listen: SocketAddr, path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::FileNotFound(path.to_path_buf()),
            _ => EngineError::Io(e),
        })?;
        let file = Arc::new(ServedFile { name: file_name(path), data: Bytes::from(data) });

        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("serving {} ({} bytes) on {}", file.name, file.data.len(), local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let uploaded = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let server = tokio::spawn(
            accept_loop(listener, file.clone(), uploaded.clone(), events_tx.clone(), cancel.clone())
                .instrument(tracing::info_span!("source", addr = %local_addr)),
        );

        Ok(Self {
            file,
            local_addr,
            uploaded,
            events_tx,
            events_rx,
            cancel,
            server,
        })
    }

}

async fn accept_loop(
    listener: TcpListener,
    file: Arc<ServedFile>,
    uploaded: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    cancel: CancellationToken,
) {
    loop {
        let (stream, address) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    continue;
                },
            },
        };
        events_tx.send(TransferEvent::PeerConnected { address }).ok();

        let file = file.clone();
        let uploaded = uploaded.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = respond(&file, &uploaded, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            tokio::select! {
                res = conn => {
                    if let Err(e) = res {
                        tracing::debug!("connection from {} closed: {}", address, e);
                    }
                },
                _ = cancel.cancelled() => {},
            }
        });
    }
}

fn respond(file: &ServedFile, uploaded: &AtomicU64, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let requested = req.uri().path().trim_start_matches('/');
    let matches = urlencoding::decode(requested).map(|name| name == file.name).unwrap_or(false);
    if !matches {
        return status_response(StatusCode::NOT_FOUND);
    }

    let len = file.data.len() as u64;
    let mut response = match *req.method() {
        Method::GET => {
            uploaded.fetch_add(len, Ordering::Relaxed);
            Response::new(Full::new(file.data.clone()))
        },
        Method::HEAD => Response::new(Full::new(Bytes::new())),
        _ => return status_response(StatusCode::METHOD_NOT_ALLOWED),
    };
    response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[async_trait::async_trait]
impl TransferSession for SourceSession {

    fn status(&self) -> SessionStatus {
        SessionStatus {
            progress: 1.0,
            total_download: 0,
            total_upload: self.uploaded.load(Ordering::Relaxed),
            total_len: self.file.data.len() as u64,
            is_finished: false,
        }
    }

    fn poll_events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn force_rediscovery(&mut self) -> Result<()> {
        self.events_tx
            .send(TransferEvent::TrackerAnnounce {
                message: format!("seeding {} on {}", self.file.name, self.local_addr),
            })
            .ok();
        Ok(())
    }

    async fn pause(&mut self) {
        self.cancel.cancel();
    }

    async fn destroy(self: Box<Self>) {
        self.cancel.cancel();
        if let Err(e) = self.server.await {
            tracing::error!("server join error: {}", e);
        }
    }

}

// Shared between a receiver session and its download task.
#[derive(Debug, Default)]
struct Transfer {

    // Body bytes of the current attempt.
    received: AtomicU64,

    // Every byte received over all attempts, headers included.
    downloaded: AtomicU64,

    total_len: AtomicU64,

    finished: AtomicBool,

}

pub struct ReceiverSession {

    client: reqwest::Client,

    url: Url,

    dest: PathBuf,

    transfer: Arc<Transfer>,

    events_tx: mpsc::UnboundedSender<TransferEvent>,

    events_rx: mpsc::UnboundedReceiver<TransferEvent>,

    cancel: CancellationToken,

    task: JoinHandle<()>,

}

impl ReceiverSession {

    fn start(client: reqwest::Client, url: Url, dest: PathBuf) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transfer = Arc::new(Transfer::default());
        let cancel = CancellationToken::new();
        let task = spawn_download(&client, &url, &dest, &transfer, &events_tx, &cancel);
        Self {
            client,
            url,
            dest,
            transfer,
            events_tx,
            events_rx,
            cancel,
            task,
        }
    }

}

fn spawn_download(
    client: &reqwest::Client,
    url: &Url,
    dest: &Path,
    transfer: &Arc<Transfer>,
    events_tx: &mpsc::UnboundedSender<TransferEvent>,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    let fetch = download(client.clone(), url.clone(), dest.to_path_buf(), transfer.clone(), events_tx.clone());
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = fetch => {
                if let Err(e) = res {
                    tracing::error!("download failed: {}", e);
                }
            },
            _ = cancel.cancelled() => tracing::debug!("download cancelled"),
        }
    }.instrument(tracing::info_span!("download", url = %url)))
}

async fn download(
    client: reqwest::Client,
    url: Url,
    dest: PathBuf,
    transfer: Arc<Transfer>,
    events: mpsc::UnboundedSender<TransferEvent>,
) -> Result<()> {

    let mut resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(EngineError::Status(resp.status().as_u16()));
    }
    if let Some(address) = resp.remote_addr() {
        events.send(TransferEvent::PeerConnected { address }).ok();
    }
    transfer.downloaded.fetch_add(header_len(&resp), Ordering::Relaxed);

    let total_len = resp.content_length().unwrap_or(0);
    transfer.total_len.store(total_len, Ordering::Relaxed);
    transfer.received.store(0, Ordering::Relaxed);

    let mut file = tokio::fs::File::create(&dest).await?;
    let mut received = 0;
    let mut pieces = 0;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        transfer.received.store(received, Ordering::Relaxed);
        transfer.downloaded.fetch_add(chunk.len() as u64, Ordering::Relaxed);

        while (pieces + 1) * BLOCK_SIZE <= received {
            events.send(TransferEvent::PieceCompleted { index: pieces as usize }).ok();
            pieces += 1;
        }
        if total_len > 0 {
            let fraction = (received as f64 / total_len as f64).min(1.0);
            events.send(TransferEvent::ProgressChanged { fraction }).ok();
        }
    }
    // Last, short piece.
    if received > pieces * BLOCK_SIZE {
        events.send(TransferEvent::PieceCompleted { index: pieces as usize }).ok();
    }
    file.flush().await?;
    file.sync_all().await?;

    if total_len == 0 {
        transfer.total_len.store(received, Ordering::Relaxed);
    }
    transfer.finished.store(true, Ordering::Release);
    events.send(TransferEvent::ProgressChanged { fraction: 1.0 }).ok();
    tracing::info!("downloaded {} bytes to {}", received, dest.display());
    Ok(())
}

// Approximate size of the response head on the wire, as HTTP/1.1 would frame it.
fn header_len(resp: &reqwest::Response) -> u64 {
    let status_line = format!("{:?} {}\r\n", resp.version(), resp.status()).len();
    let fields: usize = resp
        .headers()
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len() + 4)
        .sum();
    (status_line + fields + 2) as u64
}

#[async_trait::async_trait]
impl TransferSession for ReceiverSession {

    fn status(&self) -> SessionStatus {
        let is_finished = self.transfer.finished.load(Ordering::Acquire);
        let total_len = self.transfer.total_len.load(Ordering::Relaxed);
        let received = self.transfer.received.load(Ordering::Relaxed);
        let progress = if is_finished {
            1.0
        } else if total_len > 0 {
            (received as f64 / total_len as f64).min(1.0)
        } else {
            0.0
        };

        SessionStatus {
            progress,
            total_download: self.transfer.downloaded.load(Ordering::Relaxed),
            total_upload: 0,
            total_len,
            is_finished,
        }
    }

    fn poll_events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    // Re-checks the source with a HEAD request, restarting a download that failed.
    async fn force_rediscovery(&mut self) -> Result<()> {
        self.events_tx
            .send(TransferEvent::TrackerAnnounce { message: format!("HEAD {}", self.url) })
            .ok();

        let resp = self.client.head(self.url.clone()).send().await?;
        let available = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<u64>().ok());
        let message = match available {
            Some(len) => format!("{} ({} bytes available)", resp.status(), len),
            None => resp.status().to_string(),
        };
        self.events_tx.send(TransferEvent::TrackerReply { message }).ok();

        if self.task.is_finished()
            && !self.transfer.finished.load(Ordering::Acquire)
            && !self.cancel.is_cancelled()
        {
            tracing::info!("restarting download of {}", self.url);
            self.task = spawn_download(&self.client, &self.url, &self.dest, &self.transfer, &self.events_tx, &self.cancel);
        }
        Ok(())
    }

    async fn pause(&mut self) {
        self.cancel.cancel();
    }

    async fn destroy(self: Box<Self>) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("download join error: {}", e);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url_escapes_name() {
        let engine = HttpEngine::new(Protocol::Http1, "seeder", 6969, "0.0.0.0:6969".parse().unwrap());
        assert_eq!(engine.file_url("A_10kB").unwrap().as_str(), "http://seeder:6969/A_10kB");
        assert_eq!(engine.file_url("a b#c").unwrap().as_str(), "http://seeder:6969/a%20b%23c");
    }

    #[tokio::test]
    async fn test_source_preflight_missing_file() {
        let engine = HttpEngine::new(Protocol::Http1, "localhost", 6969, "127.0.0.1:0".parse().unwrap());
        let err = engine.preflight(Role::Source, Path::new("/nonexistent/A_10kB")).await.unwrap_err();
        assert!(matches!(err, EngineError::FileNotFound(_)));
    }
}
