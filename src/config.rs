use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("rdl/", env!("CARGO_PKG_VERSION"));
pub const PROGRESS_DIR_NAME: &str = ".progress";
pub const PROGRESS_SUFFIX: &str = "progress";

/// Where transfers land and how they are persisted.
///
/// Every path is explicit; nothing is derived from the user's home directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub download_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// `fsync` the destination file and sidecar at every checkpoint.
    pub sync_writes: bool,
    /// Capacity of the channel carrying network events into a worker.
    pub event_buffer: usize,
}

impl Config {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        let progress_dir = download_dir.join(PROGRESS_DIR_NAME);
        Self {
            download_dir,
            progress_dir,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            sync_writes: false,
            event_buffer: 64,
        }
    }

    pub fn with_progress_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.progress_dir = dir.into();
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn destination_for(&self, id: &str) -> PathBuf {
        self.download_dir.join(id)
    }
}
