use std::{
    fmt,
    path::PathBuf,
    time::Duration,
};

// Assumed number of simultaneous receivers in the swarm (one source, three leechers).
pub const DEFAULT_PEER_FANOUT: u32 = 3;

// Node id used when neither the host name nor the environment identify the node.
pub const UNKNOWN_NODE_ID: &str = "unknown";

// Environment variable overriding the node id.
pub const NODE_ID_ENV: &str = "LEECHER_ID";

// Mounted result directories, tried in this order before the working directory.
const PRIMARY_RESULTS_DIR: &str = "/results";
const SECONDARY_RESULTS_DIR: &str = "/data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {

    // Serves the file ("seeder" / "server").
    Source,

    // Downloads the file ("leecher" / "client").
    Receiver,

}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

// Wall clock knobs for the run loop.
#[derive(Debug, Clone, Copy)]
pub struct Timing {

    // Interval between polls of the transfer engine.
    pub tick: Duration,

    // How long an iteration may go without receiving a single byte.
    pub grace_window: Duration,

    // Re-announce whenever unix time is a multiple of this.
    pub reannounce_interval: Duration,

}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            grace_window: Duration::from_secs(30),
            reannounce_interval: Duration::from_secs(30),
        }
    }
}

// Immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {

    pub role: Role,

    // File being served or fetched.
    pub file_path: PathBuf,

    // Where receivers write the downloaded file.
    pub save_dir: PathBuf,

    pub iterations: u32,

    pub node_id: String,

    pub peer_fanout: u32,

    // Candidate result roots in priority order.
    pub result_dirs: Vec<PathBuf>,

    pub timing: Timing,

}

impl ExperimentConfig {

    pub fn new(role: Role, file_path: PathBuf, save_dir: PathBuf, iterations: u32) -> Self {
        Self {
            role,
            file_path,
            save_dir,
            iterations,
            node_id: detect_node_id(),
            peer_fanout: DEFAULT_PEER_FANOUT,
            result_dirs: default_result_dirs(),
            timing: Timing::default(),
        }
    }

    // Name of the file as requested from the source and written into save_dir.
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_path.to_string_lossy().into_owned())
    }

    pub fn downloaded_path(&self) -> PathBuf {
        self.save_dir.join(self.file_name())
    }
}

pub fn default_result_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from(PRIMARY_RESULTS_DIR),
        PathBuf::from(SECONDARY_RESULTS_DIR),
    ];
    match std::env::current_dir() {
        Ok(cwd) => dirs.push(cwd),
        Err(e) => tracing::warn!("cannot resolve working directory: {}", e),
    }
    dirs
}

// Resolves the node id from the host name and the environment.
pub fn detect_node_id() -> String {
    let host = hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned());
    resolve_node_id(host.as_deref(), std::env::var(NODE_ID_ENV).ok().as_deref())
}

// Containers are named after their role, so a host name mentioning "leecher" is
// taken as is. Anything else falls back to the override, then to "unknown".
pub fn resolve_node_id(host: Option<&str>, env_override: Option<&str>) -> String {
    if let Some(host) = host {
        if host.to_lowercase().contains("leecher") {
            return host.to_string();
        }
    }
    match env_override {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => UNKNOWN_NODE_ID.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_from_host() {
        assert_eq!(resolve_node_id(Some("bt-Leecher-2"), Some("other")), "bt-Leecher-2");
    }

    #[test]
    fn test_node_id_fallbacks() {
        assert_eq!(resolve_node_id(Some("seeder"), Some("leecher3")), "leecher3");
        assert_eq!(resolve_node_id(None, Some("  ")), UNKNOWN_NODE_ID);
        assert_eq!(resolve_node_id(Some("host"), None), UNKNOWN_NODE_ID);
    }

    #[test]
    fn test_file_name() {
        let config = ExperimentConfig::new(
            Role::Receiver,
            PathBuf::from("data/A_10kB"),
            PathBuf::from("downloads"),
            1,
        );
        assert_eq!(config.file_name(), "A_10kB");
        assert_eq!(config.downloaded_path(), PathBuf::from("downloads/A_10kB"));
    }
}
