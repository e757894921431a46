// Durable result files.
//
// Every append is a locked read-merge-write: an exclusive advisory lock is taken
// on `<file>.lock`, the existing rows are read, the record appended, and the new
// contents committed with an atomic rename. Writers that honour the lock never
// lose each other's records, and readers never see a partially written file.
// Filesystems that ignore advisory locks still get the atomic rename, but two
// writers targeting the same file there can drop a record.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use atomic_write_file::AtomicWriteFile;
use fs2::FileExt;
use crate::{
    record::{IterationResult, RunSummary, SizeCategory},
    table::{self, Record, TableError},
};

// Shared by every node.
pub const SUMMARY_FILE_NAME: &str = "all_nodes_summary.csv";

const ITERATION_FILE_SUFFIX: &str = "_results.csv";
const WRITE_MARKER_PREFIX: &str = ".write_test";

// Distinguishes write markers of concurrent appends within one process.
static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(thiserror::Error, Debug)]
pub enum StoreError {

    #[error("no writable result directory among {0:?}")]
    NoWritableDestination(Vec<PathBuf>),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("existing result file {path} cannot be merged: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: TableError,
    },

}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone)]
pub struct ResultStore {

    // Root directories in priority order.
    candidates: Vec<PathBuf>,

}

impl ResultStore {

    pub fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    // First candidate that exists and accepts a write right now.
    // Mount state can change, so this is re-evaluated on every append.
    pub fn select_destination(&self) -> Result<PathBuf> {
        for (i, dir) in self.candidates.iter().enumerate() {
            match check_writable(dir) {
                Ok(()) => {
                    if i > 0 {
                        tracing::warn!("falling back to {}, results may not be visible on the host", dir.display());
                    }
                    return Ok(dir.clone());
                },
                Err(e) => tracing::debug!("result directory {} rejected: {}", dir.display(), e),
            }
        }
        Err(StoreError::NoWritableDestination(self.candidates.clone()))
    }

    // Logs the state of every candidate, used once at startup.
    pub fn check_destinations(&self) {
        for dir in &self.candidates {
            match check_writable(dir) {
                Ok(()) => tracing::info!("{} is writable", dir.display()),
                Err(e) => tracing::warn!("{} is not usable: {}", dir.display(), e),
            }
        }
    }

    pub fn append_iteration(&self, record: &IterationResult) -> Result<PathBuf> {
        let name = iteration_file_name(record.size_category, &record.node_id);
        self.append(&name, record)
    }

    pub fn append_summary(&self, record: &RunSummary) -> Result<PathBuf> {
        self.append(SUMMARY_FILE_NAME, record)
    }

    fn append<R: Record + Clone>(&self, file_name: &str, record: &R) -> Result<PathBuf> {
        let root = self.select_destination()?;
        let path = root.join(file_name);
        merge_record(&path, record)?;
        tracing::info!("result saved to {}", path.display());
        Ok(path)
    }

}

// Existence and permission bits can lie on mounted volumes, so actually write.
fn check_writable(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a directory"));
    }
    let marker = dir.join(format!(
        "{}_{}_{}",
        WRITE_MARKER_PREFIX,
        std::process::id(),
        MARKER_SEQ.fetch_add(1, Ordering::Relaxed),
    ));
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&marker)?;
    let written = file.write_all(b"test").and_then(|_| file.sync_all());
    drop(file);
    let removed = fs::remove_file(&marker);
    written.and(removed)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn merge_record<R: Record + Clone>(path: &Path, record: &R) -> Result<()> {
    let lock_path = lock_path(path);
    let lock = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(io_err(&lock_path))?;
    FileExt::lock_exclusive(&lock).map_err(io_err(&lock_path))?;

    let result = read_records::<R>(path).and_then(|mut records| {
        records.push(record.clone());
        let data = table::to_csv(&records).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        write_file(path, &data)
    });

    if let Err(e) = FileExt::unlock(&lock) {
        tracing::warn!("failed to release {}: {}", lock_path.display(), e);
    }
    result
}

// A missing file has no rows.
pub fn read_records<R: Record>(path: &Path) -> Result<Vec<R>> {
    match fs::read(path) {
        Ok(data) => table::from_csv(&data).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(io_err(path)(e)),
    }
}

pub(crate) fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = AtomicWriteFile::options().open(path).map_err(io_err(path))?;
    file.write_all(data).map_err(io_err(path))?;
    file.commit().map_err(io_err(path))
}

// Node ids come from host names and the environment, keep them path safe.
fn sanitize(node_id: &str) -> String {
    node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

pub fn iteration_file_name(category: SizeCategory, node_id: &str) -> String {
    format!("{}_{}{}", category, sanitize(node_id), ITERATION_FILE_SUFFIX)
}

// Inverse of `iteration_file_name`, None for any other file.
pub fn parse_iteration_file_name(name: &str) -> Option<(SizeCategory, String)> {
    let stem = name.strip_suffix(ITERATION_FILE_SUFFIX)?;
    let (category, node) = stem.split_once('_')?;
    if node.is_empty() {
        return None;
    }
    Some((category.parse().ok()?, node.to_string()))
}
