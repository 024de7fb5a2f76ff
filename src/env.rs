use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DATA_DIR_VAR: &str = "BOTTLES_DATA_DIR";
const REPOSITORY_DIR_VAR: &str = "BOTTLES_REPOSITORY_DIR";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_PROBE_HOST: &str = "repo.usebottles.com:443";

/// Returns the root directory used for components (mirrors Bottles defaults).
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = env::var_os(DATA_DIR_VAR) {
        return PathBuf::from(dir);
    }
    let base = env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".local").join("share"))
        })
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("bottles")
}

/// Local manifest repository; defaults to `<data dir>/repository`.
pub fn default_repository_dir(data_dir: &std::path::Path) -> PathBuf {
    env::var_os(REPOSITORY_DIR_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("repository"))
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub repository_dir: PathBuf,
    /// How long a queued install sleeps before checking the ticket gate again.
    pub poll_interval: Duration,
    /// `None` leaves timeouts to the HTTP client defaults.
    pub http_timeout: Option<Duration>,
    pub probe_host: String,
}

impl Settings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let repository_dir = default_repository_dir(&data_dir);
        Self {
            data_dir,
            repository_dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http_timeout: None,
            probe_host: DEFAULT_PROBE_HOST.to_owned(),
        }
    }

    pub fn with_repository_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.repository_dir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.http_timeout = timeout;
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}
