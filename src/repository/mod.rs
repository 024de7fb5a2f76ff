use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};

use crate::component::models::{ComponentManifest, RepositoryIndex};

const INDEX_FILE: &str = "index.json";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of component manifests and of the catalog index.
///
/// Implementations return `None`/empty when offline rather than failing.
pub trait ManifestRepository: Send + Sync {
    fn get(&self, name: &str) -> Option<ComponentManifest>;
    fn catalog(&self) -> RepositoryIndex;
}

pub trait ConnectionChecker: Send + Sync {
    fn check_connection(&self) -> bool;
}

/// Repository laid out on disk: `index.json` plus one `<name>.json` per component.
#[derive(Clone, Debug)]
pub struct LocalRepository {
    dir: PathBuf,
}

impl LocalRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn manifest_path(&self, name: &str) -> Option<PathBuf> {
        // Names come from the catalog or the command line; keep lookups inside the repository.
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            warn!("repository: refusing suspicious component name {name:?}");
            return None;
        }
        Some(self.dir.join(format!("{name}.json")))
    }
}

impl ManifestRepository for LocalRepository {
    fn get(&self, name: &str) -> Option<ComponentManifest> {
        let path = self.manifest_path(name)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("repository: no manifest at {} ({err})", path.display());
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!("repository: {} parse error: {err}", path.display());
                None
            }
        }
    }

    fn catalog(&self) -> RepositoryIndex {
        let path = self.dir.join(INDEX_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("repository: unable to read {} ({err})", path.display());
                return RepositoryIndex::new();
            }
        };
        serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!("repository: {} parse error: {err}", path.display());
            RepositoryIndex::new()
        })
    }
}

/// Considers the network reachable when a TCP connection to `host:port` succeeds.
#[derive(Clone, Debug)]
pub struct TcpConnectionChecker {
    host: String,
}

impl TcpConnectionChecker {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl ConnectionChecker for TcpConnectionChecker {
    fn check_connection(&self) -> bool {
        let addrs = match self.host.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                warn!("connection: cannot resolve {}: {err}", self.host);
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok() {
                return true;
            }
        }
        warn!("connection: {} unreachable", self.host);
        false
    }
}
