use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};

use crate::archive::ArchiveInstaller;
use crate::env::Settings;
use crate::environment::{EnvironmentManager, LocalEnvironments, natural_cmp};
use crate::error::{ComponentError, ComponentResult};
use crate::fetch::{Fetcher, checksum};
use crate::paths::ComponentPaths;
use crate::repository::{
    ConnectionChecker, LocalRepository, ManifestRepository, TcpConnectionChecker,
};

use self::models::{
    CatalogEntry, CatalogIndex, Category, ComponentManifest, ManifestFile, Outcome,
    PostInstallAction,
};
use self::progress::{ProgressEvent, ProgressSender, emit};
use self::queue::{InstallQueue, TicketId};

pub mod models;
pub mod progress;
pub mod queue;

/// Coordinates download, verification, extraction and registration of components.
pub struct ComponentManager {
    paths: ComponentPaths,
    fetcher: Fetcher,
    installer: ArchiveInstaller,
    repository: Arc<dyn ManifestRepository>,
    connection: Arc<dyn ConnectionChecker>,
    environments: Arc<dyn EnvironmentManager>,
    queue: Arc<InstallQueue>,
    manifests: Mutex<HashMap<String, Arc<ComponentManifest>>>,
    catalog: Mutex<Option<CatalogIndex>>,
    cancel_flag: AtomicBool,
}

impl ComponentManager {
    pub fn new(
        settings: &Settings,
        repository: Arc<dyn ManifestRepository>,
        connection: Arc<dyn ConnectionChecker>,
        environments: Arc<dyn EnvironmentManager>,
    ) -> ComponentResult<Self> {
        let paths = ComponentPaths::new(&settings.data_dir);
        Ok(Self {
            fetcher: Fetcher::new(settings.http_timeout)?,
            installer: ArchiveInstaller::new(paths.clone()),
            paths,
            repository,
            connection,
            environments,
            queue: InstallQueue::new(settings.poll_interval),
            manifests: Mutex::new(HashMap::new()),
            catalog: Mutex::new(None),
            cancel_flag: AtomicBool::new(false),
        })
    }

    /// Wire up the on-disk repository, TCP connectivity probe and directory-backed environments.
    pub fn from_settings(settings: &Settings) -> ComponentResult<Self> {
        let paths = ComponentPaths::new(&settings.data_dir);
        paths.ensure_dirs().map_err(|e| {
            ComponentError::io(
                format!("failed to prepare {}", settings.data_dir.display()),
                e,
            )
        })?;
        Self::new(
            settings,
            Arc::new(LocalRepository::new(&settings.repository_dir)),
            Arc::new(TcpConnectionChecker::new(settings.probe_host.clone())),
            Arc::new(LocalEnvironments::new(paths)),
        )
    }

    pub fn paths(&self) -> &ComponentPaths {
        &self.paths
    }

    pub fn queue(&self) -> &Arc<InstallQueue> {
        &self.queue
    }

    pub fn environments(&self) -> &Arc<dyn EnvironmentManager> {
        &self.environments
    }

    /// Abort the download of the install currently holding the queue, or of the next one
    /// admitted when none is running. The request is cleared once that install returns.
    pub fn cancel_current(&self) {
        warn!("install: cancellation requested");
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Forget memoized manifests and catalog.
    pub fn invalidate_caches(&self) {
        lock(&self.manifests).clear();
        lock(&self.catalog).take();
        debug!("cache: manifests and catalog invalidated");
    }

    /// Manifest for `name`, memoized for the lifetime of the manager.
    pub fn get_component(&self, name: &str) -> Option<Arc<ComponentManifest>> {
        if let Some(manifest) = lock(&self.manifests).get(name) {
            return Some(Arc::clone(manifest));
        }
        let manifest = Arc::new(self.repository.get(name)?);
        lock(&self.manifests).insert(name.to_owned(), Arc::clone(&manifest));
        Some(manifest)
    }

    /// Install `name` of `category`, waiting for any running install to finish first.
    pub async fn install(
        &self,
        category: Category,
        name: &str,
        progress: Option<&ProgressSender>,
    ) -> Outcome {
        let ticket = self.queue.acquire().await;
        info!("install: [{name}] ({category}) ticket {}", ticket.id());

        let result = self
            .run_install(ticket.id(), category, name, progress)
            .await;
        self.cancel_flag.store(false, Ordering::SeqCst);
        drop(ticket);
        match result {
            Ok(path) => {
                info!("install: [{name}] ready at {}", path.display());
                Outcome::success()
            }
            Err(err) if err.is_download_failure() => {
                error!("install: [{name}] download failed: {err}");
                Outcome::from(err)
            }
            Err(err) => {
                error!("install: [{name}] failed: {err}");
                Outcome::from(err)
            }
        }
    }

    async fn run_install(
        &self,
        ticket: TicketId,
        category: Category,
        name: &str,
        progress: Option<&ProgressSender>,
    ) -> ComponentResult<PathBuf> {
        let manifest = self
            .get_component(name)
            .ok_or_else(|| ComponentError::ManifestNotFound(name.to_owned()))?;
        if !manifest.category.shares_root_with(category) {
            warn!(
                "install: [{name}] requested as {category} but manifest says {}",
                manifest.category
            );
        }
        let file = manifest.primary_file()?;
        if let Some(expected) = &file.checksum {
            if checksum::ChecksumKind::for_digest(expected).is_none() {
                return Err(ComponentError::InvalidManifest {
                    name: name.to_owned(),
                    reason: checksum::unverifiable_reason(expected),
                });
            }
        }

        if let Err(err) = self.download(ticket, file, progress).await {
            emit(progress, ProgressEvent::Failed { ticket });
            return Err(err);
        }

        let installed = self.installer.extract(name, category, file.staged_name())?;
        self.run_post_install(category, &manifest.post_install)?;

        if category.is_ephemeral() {
            let staged = self.paths.staged_file(file.staged_name());
            match fs::remove_file(&staged) {
                Ok(()) => debug!("install: removed staged {}", staged.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("install: could not remove {}: {err}", staged.display()),
            }
        }

        self.environments.check_components(category);
        self.environments.organize_components();
        lock(&self.catalog).take();
        Ok(installed)
    }

    /// Make the primary archive available in the staging directory under its final name.
    async fn download(
        &self,
        ticket: TicketId,
        file: &ManifestFile,
        progress: Option<&ProgressSender>,
    ) -> ComponentResult<()> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(ComponentError::Cancelled);
        }
        let staged = self.paths.staged_file(file.staged_name());
        let download_path = self.paths.staged_file(&file.file_name);

        let just_downloaded = if staged.is_file() {
            warn!(
                "install: [{}] already staged, skipping download",
                file.staged_name()
            );
            false
        } else {
            let sender = progress.cloned();
            let fetched = self
                .fetcher
                .fetch(
                    &file.url,
                    &download_path,
                    Some(&self.cancel_flag),
                    |count, block_size, total_size| {
                        emit(
                            sender.as_ref(),
                            ProgressEvent::Transfer {
                                ticket,
                                count,
                                block_size,
                                total_size,
                            },
                        )
                    },
                )
                .await;
            if let Err(err) = fetched {
                // A partial file must not be mistaken for a cached archive later.
                let _ = fs::remove_file(&download_path);
                return Err(err);
            }
            true
        };

        let fetched_path = if just_downloaded {
            &download_path
        } else {
            &staged
        };
        if !fetched_path.is_file() {
            return Err(ComponentError::io(
                format!("downloaded file {} is missing", fetched_path.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        if let Some(expected) = &file.checksum {
            if let Err(err) = checksum::verify_checksum(fetched_path, expected) {
                if matches!(err, ComponentError::ChecksumMismatch { .. }) {
                    let _ = fs::remove_file(fetched_path);
                }
                return Err(err);
            }
        }

        if just_downloaded && file.rename.is_some() {
            info!(
                "install: renaming [{}] to [{}]",
                file.file_name,
                file.staged_name()
            );
            fs::rename(&download_path, &staged).map_err(|e| {
                ComponentError::io(format!("failed to rename {}", download_path.display()), e)
            })?;
        }

        emit(progress, ProgressEvent::Completed { ticket });
        Ok(())
    }

    fn run_post_install(
        &self,
        category: Category,
        actions: &[PostInstallAction],
    ) -> ComponentResult<()> {
        let root = self.paths.category_root(category);
        for action in actions {
            match action {
                PostInstallAction::Rename { source, dest } => {
                    let dest_path = root.join(dest);
                    if dest_path.is_dir() {
                        debug!("install: {} already present", dest_path.display());
                        continue;
                    }
                    let source_path = root.join(source);
                    fs::rename(&source_path, &dest_path).map_err(|e| {
                        ComponentError::PostInstall(format!(
                            "rename {} to {}: {e}",
                            source_path.display(),
                            dest_path.display()
                        ))
                    })?;
                    info!("install: moved [{source}] to [{dest}]");
                }
                PostInstallAction::Unsupported => {
                    warn!("install: skipping unsupported post-install action");
                }
            }
        }
        Ok(())
    }

    /// Whether any bottle references `name`; shared infrastructure always counts as used.
    pub fn is_in_use(&self, category: Category, name: &str) -> bool {
        if category.is_shared_infrastructure() {
            return true;
        }
        self.environments
            .local_bottles()
            .values()
            .any(|bottle| bottle.selection(category) == Some(name))
    }

    pub fn uninstall(&self, category: Category, name: &str) -> Outcome {
        if self.is_in_use(category, name) {
            warn!("uninstall: [{name}] ({category}) is in use");
            return ComponentError::AlreadyInUse(name.to_owned()).into();
        }
        let path = self.paths.component_path(category, name);
        if !path.exists() {
            warn!("uninstall: {} does not exist", path.display());
            return ComponentError::NotInstalled(name.to_owned()).into();
        }
        if let Err(err) = fs::remove_dir_all(&path) {
            error!("uninstall: failed to remove {}: {err}", path.display());
            return ComponentError::io(format!("error removing component {name}"), err).into();
        }
        info!("uninstall: removed {}", path.display());

        self.environments.check_components(category);
        self.environments.organize_components();
        lock(&self.catalog).take();
        Outcome::success()
    }

    /// Repository catalog merged with the installed sets. Offline yields an empty,
    /// unmemoized catalog.
    pub fn fetch_catalog(&self) -> CatalogIndex {
        if let Some(cached) = lock(&self.catalog).as_ref() {
            return cached.clone();
        }
        if !self.connection.check_connection() {
            warn!("catalog: offline, returning empty catalog");
            return CatalogIndex::default();
        }

        let mut installed: HashMap<&'static str, HashSet<String>> = HashMap::new();
        let mut entries: BTreeMap<Category, Vec<CatalogEntry>> = BTreeMap::new();
        for (name, entry) in self.repository.catalog() {
            let is_installed = installed
                .entry(entry.category.root_dir_name())
                .or_insert_with(|| {
                    self.environments
                        .installed_components(entry.category)
                        .into_iter()
                        .collect()
                })
                .contains(&name);
            entries
                .entry(entry.category)
                .or_default()
                .push(CatalogEntry {
                    name,
                    category: entry.category,
                    sub_category: entry.sub_category,
                    installed: is_installed,
                    fields: entry.fields,
                });
        }
        for group in entries.values_mut() {
            group.sort_by(|a, b| natural_cmp(&b.name, &a.name));
        }

        let catalog = CatalogIndex { entries };
        debug!(
            "catalog: {} entries",
            catalog.entries.values().map(Vec::len).sum::<usize>()
        );
        *lock(&self.catalog) = Some(catalog.clone());
        catalog
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{noise, tar_gz, tar_xz};
    use crate::component::models::RepositoryIndex;
    use crate::environment::BottleConfig;
    use crate::fetch::tests::raw_server;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type EventLog = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct MockRepository {
        manifests: HashMap<String, ComponentManifest>,
        index: RepositoryIndex,
        catalog_calls: AtomicUsize,
        log: EventLog,
    }

    impl ManifestRepository for MockRepository {
        fn get(&self, name: &str) -> Option<ComponentManifest> {
            lock(&self.log).push(format!("get {name}"));
            self.manifests.get(name).cloned()
        }

        fn catalog(&self) -> RepositoryIndex {
            self.catalog_calls.fetch_add(1, Ordering::SeqCst);
            self.index.clone()
        }
    }

    struct MockConnection(AtomicBool);

    impl ConnectionChecker for MockConnection {
        fn check_connection(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct MockEnvironments {
        bottles: BTreeMap<String, BottleConfig>,
        installed: BTreeMap<Category, Vec<String>>,
        organized: AtomicUsize,
        log: EventLog,
    }

    impl EnvironmentManager for MockEnvironments {
        fn local_bottles(&self) -> BTreeMap<String, BottleConfig> {
            self.bottles.clone()
        }

        fn installed_components(&self, category: Category) -> Vec<String> {
            self.installed.get(&category).cloned().unwrap_or_default()
        }

        fn check_components(&self, category: Category) {
            lock(&self.log).push(format!("check {category}"));
        }

        fn organize_components(&self) {
            self.organized.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        manager: ComponentManager,
        repository: Arc<MockRepository>,
        environments: Arc<MockEnvironments>,
        connection: Arc<MockConnection>,
        log: EventLog,
    }

    impl Harness {
        fn new(manifests: Vec<ComponentManifest>) -> Self {
            Self::with(
                manifests,
                RepositoryIndex::new(),
                MockEnvironments::default(),
            )
        }

        fn with(
            manifests: Vec<ComponentManifest>,
            index: RepositoryIndex,
            mut environments: MockEnvironments,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let settings = Settings::new(dir.path())
                .with_poll_interval(Duration::from_millis(10))
                .with_http_timeout(Some(Duration::from_secs(10)));
            let log = EventLog::default();
            environments.log = Arc::clone(&log);
            let repository = Arc::new(MockRepository {
                manifests: manifests.into_iter().map(|m| (m.name.clone(), m)).collect(),
                index,
                catalog_calls: AtomicUsize::new(0),
                log: Arc::clone(&log),
            });
            let environments = Arc::new(environments);
            let connection = Arc::new(MockConnection(AtomicBool::new(true)));
            let manager = ComponentManager::new(
                &settings,
                repository.clone(),
                connection.clone(),
                environments.clone(),
            )
            .unwrap();
            manager.paths().ensure_dirs().unwrap();
            Self {
                _dir: dir,
                manager,
                repository,
                environments,
                connection,
                log,
            }
        }

        fn assert_gate_free(&self) {
            assert!(
                self.manager.queue().try_acquire().is_some(),
                "install ticket leaked"
            );
        }
    }

    fn manifest(
        name: &str,
        category: Category,
        url: String,
        checksum: Option<String>,
    ) -> ComponentManifest {
        ComponentManifest {
            name: name.into(),
            category,
            provider: None,
            channel: None,
            files: vec![ManifestFile {
                url,
                file_name: format!("{name}.tar.gz"),
                rename: None,
                checksum,
                file_size: None,
            }],
            post_install: Vec::new(),
        }
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
        Mock::given(method("HEAD"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn installs_dxvk_with_verified_checksum() {
        let server = MockServer::start().await;
        let archive = tar_gz(
            "dxvk-2.3",
            &[("x64/d3d11.dll", &noise(4_000)), ("x32/d3d11.dll", b"dll")],
        );
        serve(&server, "/dxvk-2.3.tar.gz", archive.clone()).await;
        let harness = Harness::new(vec![manifest(
            "dxvk-2.3",
            Category::Dxvk,
            format!("{}/dxvk-2.3.tar.gz", server.uri()),
            Some(sha256_hex(&archive).to_uppercase()),
        )]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = harness
            .manager
            .install(Category::Dxvk, "dxvk-2.3", Some(&tx))
            .await;

        assert_eq!(outcome, Outcome::success());
        let installed = harness
            .manager
            .paths()
            .component_path(Category::Dxvk, "dxvk-2.3");
        assert_eq!(fs::read(installed.join("x32/d3d11.dll")).unwrap(), b"dll");
        assert!(
            harness
                .manager
                .paths()
                .staged_file("dxvk-2.3.tar.gz")
                .is_file()
        );
        assert_eq!(
            *lock(&harness.log),
            vec!["get dxvk-2.3".to_owned(), "check dxvk".to_owned()]
        );
        assert_eq!(harness.environments.organized.load(Ordering::SeqCst), 1);
        harness.assert_gate_free();

        let events = drain(&mut rx);
        let counts: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Transfer { count, .. } => Some(*count),
                _ => None,
            })
            .collect();
        assert!(!counts.is_empty());
        assert!(counts.windows(2).all(|w| w[0] < w[1]));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Completed { .. })
        ));
        let ticket = events[0].ticket();
        assert!(events.iter().all(|e| e.ticket() == ticket));
    }

    #[tokio::test]
    async fn checksum_mismatch_deletes_artifact_and_fails() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/dxvk-2.3.tar.gz",
            tar_gz("dxvk-2.3", &[("a", b"a")]),
        )
        .await;
        let harness = Harness::new(vec![manifest(
            "dxvk-2.3",
            Category::Dxvk,
            format!("{}/dxvk-2.3.tar.gz", server.uri()),
            Some("f".repeat(64)),
        )]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = harness
            .manager
            .install(Category::Dxvk, "dxvk-2.3", Some(&tx))
            .await;

        assert!(!outcome.ok);
        assert!(outcome.message.unwrap().contains("corrupted"));
        assert!(
            !harness
                .manager
                .paths()
                .staged_file("dxvk-2.3.tar.gz")
                .exists()
        );
        assert!(
            !harness
                .manager
                .paths()
                .component_path(Category::Dxvk, "dxvk-2.3")
                .exists()
        );
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ProgressEvent::Failed { .. })
        ));
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn missing_manifest_fails_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let harness = Harness::new(Vec::new());

        let outcome = harness
            .manager
            .install(Category::Vkd3d, "vkd3d-proton-2.10", None)
            .await;

        assert!(!outcome.ok);
        assert!(lock(&harness.log).iter().all(|e| !e.starts_with("check")));
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn bad_status_fails_and_signals_progress_failure() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let harness = Harness::new(vec![manifest(
            "nvapi-0.7",
            Category::Nvapi,
            format!("{}/nvapi-0.7.tar.gz", server.uri()),
            None,
        )]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = harness
            .manager
            .install(Category::Nvapi, "nvapi-0.7", Some(&tx))
            .await;

        assert!(!outcome.ok);
        assert!(outcome.message.unwrap().contains("503"));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ProgressEvent::Failed { .. }]
        ));
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn corrupt_archive_fails_and_cleans_up() {
        let server = MockServer::start().await;
        let full = tar_gz("latencyflex-v0.1.1", &[("layer.so", &noise(128 * 1024))]);
        serve(
            &server,
            "/latencyflex-v0.1.1.tar.gz",
            full[..full.len() / 2].to_vec(),
        )
        .await;
        let harness = Harness::new(vec![manifest(
            "latencyflex-v0.1.1",
            Category::LatencyFlex,
            format!("{}/latencyflex-v0.1.1.tar.gz", server.uri()),
            None,
        )]);

        let outcome = harness
            .manager
            .install(Category::LatencyFlex, "latencyflex-v0.1.1", None)
            .await;

        assert!(!outcome.ok);
        let paths = harness.manager.paths();
        assert!(!paths.staged_file("latencyflex-v0.1.1.tar.gz").exists());
        assert!(
            !paths
                .component_path(Category::LatencyFlex, "latencyflex-v0.1.1")
                .exists()
        );
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn manifest_without_files_releases_ticket() {
        let mut broken = manifest("dxvk-0", Category::Dxvk, String::new(), None);
        broken.files.clear();
        let harness = Harness::new(vec![broken]);

        let outcome = harness
            .manager
            .install(Category::Dxvk, "dxvk-0", None)
            .await;

        assert!(!outcome.ok);
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn unknown_manifest_category_releases_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("repository");
        fs::create_dir_all(&repo_dir).unwrap();
        fs::write(
            repo_dir.join("gallium-1.0.json"),
            r#"{"name": "gallium-1.0", "category": "gallium",
                "files": [{"url": "https://example.invalid/g.tar.gz", "file_name": "g.tar.gz"}]}"#,
        )
        .unwrap();
        let settings = Settings::new(dir.path().join("data"))
            .with_repository_dir(&repo_dir)
            .with_poll_interval(Duration::from_millis(10));
        let manager = ComponentManager::from_settings(&settings).unwrap();

        let outcome = manager.install(Category::Dxvk, "gallium-1.0", None).await;

        assert!(!outcome.ok);
        assert!(manager.queue().try_acquire().is_some());
        assert!(
            manager
                .paths()
                .temp_dir()
                .read_dir()
                .unwrap()
                .next()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unverifiable_checksum_is_rejected_before_download() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let harness = Harness::new(vec![manifest(
            "dxvk-2.3",
            Category::Dxvk,
            format!("{}/dxvk-2.3.tar.gz", server.uri()),
            Some("abcd1234".into()),
        )]);

        let outcome = harness
            .manager
            .install(Category::Dxvk, "dxvk-2.3", None)
            .await;

        assert!(!outcome.ok);
        assert!(outcome.message.unwrap().contains("neither an MD5"));
        let temp = harness.manager.paths().temp_dir();
        assert!(temp.read_dir().unwrap().next().is_none());
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn installs_xz_runner_with_suffix_stripped() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/soda-7.0-9-x86_64.tar.xz",
            tar_xz(
                "soda-7.0-9-x86_64",
                &[("bin/wine", b"#!"), ("lib/wine.so", b"elf")],
            ),
        )
        .await;
        let mut soda = manifest(
            "soda-7.0-9",
            Category::Runner,
            format!("{}/soda-7.0-9-x86_64.tar.xz", server.uri()),
            None,
        );
        soda.files[0].file_name = "soda-7.0-9-x86_64.tar.xz".into();
        let harness = Harness::new(vec![soda]);

        let outcome = harness
            .manager
            .install(Category::Runner, "soda-7.0-9", None)
            .await;

        assert_eq!(outcome, Outcome::success());
        let runners = harness.manager.paths().category_root(Category::Runner);
        assert!(runners.join("soda-7.0-9/bin/wine").is_file());
        assert!(!runners.join("soda-7.0-9-x86_64").exists());
        assert_eq!(
            *lock(&harness.log),
            vec!["get soda-7.0-9".to_owned(), "check runner".to_owned()]
        );
    }

    #[tokio::test]
    async fn cancel_during_transfer_discards_the_partial_download() {
        let archive = tar_gz("dxvk-2.3", &[("x64/d3d11.dll", &noise(64 * 1024))]);
        let url = raw_server(archive, true, Some((4096, Duration::from_millis(400))));
        let harness = Harness::new(vec![manifest(
            "dxvk-2.3",
            Category::Dxvk,
            format!("{url}/dxvk-2.3.tar.gz"),
            None,
        )]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel_on_first_block = async {
            while let Some(event) = rx.recv().await {
                if matches!(event, ProgressEvent::Transfer { .. }) {
                    harness.manager.cancel_current();
                    break;
                }
            }
        };
        let (outcome, ()) = tokio::join!(
            harness
                .manager
                .install(Category::Dxvk, "dxvk-2.3", Some(&tx)),
            cancel_on_first_block,
        );

        assert!(!outcome.ok);
        assert!(outcome.message.unwrap().contains("cancelled"));
        let paths = harness.manager.paths();
        assert!(!paths.staged_file("dxvk-2.3.tar.gz").exists());
        assert!(!paths.component_path(Category::Dxvk, "dxvk-2.3").exists());
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ProgressEvent::Failed { .. })
        ));
        harness.assert_gate_free();

        // The request only applied to the install it interrupted.
        let retry = harness
            .manager
            .install(Category::Dxvk, "dxvk-2.3", None)
            .await;
        assert_eq!(retry, Outcome::success());
        assert!(paths.component_path(Category::Dxvk, "dxvk-2.3").is_dir());
    }

    #[tokio::test]
    async fn cancel_requested_while_queued_is_kept_until_admission() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let harness = Harness::new(vec![manifest(
            "dxvk-2.3",
            Category::Dxvk,
            format!("{}/dxvk-2.3.tar.gz", server.uri()),
            None,
        )]);
        let held = harness.manager.queue().try_acquire().unwrap();

        let install = harness.manager.install(Category::Dxvk, "dxvk-2.3", None);
        tokio::pin!(install);
        let waited = tokio::time::timeout(Duration::from_millis(50), &mut install).await;
        assert!(waited.is_err());
        harness.manager.cancel_current();
        drop(held);

        let outcome = install.await;
        assert!(!outcome.ok);
        assert!(outcome.message.unwrap().contains("cancelled"));
        assert!(!harness.manager.cancel_flag.load(Ordering::SeqCst));
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn staged_archive_skips_the_network() {
        let server = MockServer::start().await;
        let archive = tar_gz("vkd3d-proton-2.10", &[("x64/d3d12.dll", b"dll")]);
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
            .expect(1)
            .mount(&server)
            .await;
        let harness = Harness::new(vec![manifest(
            "vkd3d-proton-2.10",
            Category::Vkd3d,
            format!("{}/vkd3d-proton-2.10.tar.gz", server.uri()),
            None,
        )]);
        let installed = harness
            .manager
            .paths()
            .component_path(Category::Vkd3d, "vkd3d-proton-2.10");

        let first = harness
            .manager
            .install(Category::Vkd3d, "vkd3d-proton-2.10", None)
            .await;
        assert!(first.ok);
        fs::remove_dir_all(&installed).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let second = harness
            .manager
            .install(Category::Vkd3d, "vkd3d-proton-2.10", Some(&tx))
            .await;

        assert!(second.ok);
        assert!(installed.join("x64/d3d12.dll").is_file());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ProgressEvent::Completed { .. }]
        ));
        server.verify().await;
    }

    #[tokio::test]
    async fn renames_fresh_download_and_runs_post_install() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/download/latest",
            tar_gz("lutris-ge-8", &[("bin/wine", b"#!")]),
        )
        .await;
        let mut runner = manifest(
            "lutris-GE-Proton8-26",
            Category::Runner,
            format!("{}/download/latest", server.uri()),
            None,
        );
        runner.files[0].file_name = "latest".into();
        runner.files[0].rename = Some("lutris-GE-Proton8-26.tar.gz".into());
        runner.post_install = vec![
            PostInstallAction::Rename {
                source: "lutris-ge-8".into(),
                dest: "lutris-GE-Proton8-26".into(),
            },
            PostInstallAction::Unsupported,
        ];
        let harness = Harness::new(vec![runner]);

        let outcome = harness
            .manager
            .install(Category::Runner, "lutris-GE-Proton8-26", None)
            .await;

        assert_eq!(outcome, Outcome::success());
        let paths = harness.manager.paths();
        assert!(paths.staged_file("lutris-GE-Proton8-26.tar.gz").is_file());
        assert!(!paths.staged_file("latest").exists());
        let runners = paths.category_root(Category::Runner);
        assert!(runners.join("lutris-GE-Proton8-26/bin/wine").is_file());
        assert!(!runners.join("lutris-ge-8").exists());
    }

    #[tokio::test]
    async fn ephemeral_categories_drop_the_staged_archive() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/runtime-0.6.tar.gz",
            tar_gz("runtime", &[("lib/libfoo.so", b"elf")]),
        )
        .await;
        let harness = Harness::new(vec![manifest(
            "runtime-0.6",
            Category::Runtime,
            format!("{}/runtime-0.6.tar.gz", server.uri()),
            None,
        )]);

        let outcome = harness
            .manager
            .install(Category::Runtime, "runtime-0.6", None)
            .await;

        assert!(outcome.ok);
        let paths = harness.manager.paths();
        assert!(!paths.staged_file("runtime-0.6.tar.gz").exists());
        assert!(
            paths
                .category_root(Category::Runtime)
                .join("runtime/lib/libfoo.so")
                .is_file()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_installs_are_serialized() {
        let server = MockServer::start().await;
        for name in ["dxvk-2.3", "vkd3d-proton-2.10"] {
            let route = format!("/{name}.tar.gz");
            Mock::given(method("HEAD"))
                .and(path(route.as_str()))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(route.as_str()))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_bytes(tar_gz(name, &[("file", b"x")]))
                        .set_delay(Duration::from_millis(150)),
                )
                .mount(&server)
                .await;
        }
        let harness = Harness::new(vec![
            manifest(
                "dxvk-2.3",
                Category::Dxvk,
                format!("{}/dxvk-2.3.tar.gz", server.uri()),
                None,
            ),
            manifest(
                "vkd3d-proton-2.10",
                Category::Vkd3d,
                format!("{}/vkd3d-proton-2.10.tar.gz", server.uri()),
                None,
            ),
        ]);

        let (a, b) = tokio::join!(
            harness.manager.install(Category::Dxvk, "dxvk-2.3", None),
            harness
                .manager
                .install(Category::Vkd3d, "vkd3d-proton-2.10", None),
        );
        assert!(a.ok && b.ok);

        // Each install must finish before the next one resolves its manifest.
        let log = lock(&harness.log).clone();
        assert_eq!(log.len(), 4);
        let pair = |get: &str| match get {
            "get dxvk-2.3" => "check dxvk",
            "get vkd3d-proton-2.10" => "check vkd3d",
            other => panic!("unexpected event {other}"),
        };
        assert_eq!(log[1], pair(&log[0]));
        assert_eq!(log[3], pair(&log[2]));
        harness.assert_gate_free();
    }

    #[tokio::test]
    async fn queued_install_waits_for_the_active_ticket() {
        let harness = Harness::new(Vec::new());
        let held = harness.manager.queue().try_acquire().unwrap();

        let install = harness.manager.install(Category::Dxvk, "dxvk-2.3", None);
        tokio::pin!(install);
        let waited = tokio::time::timeout(Duration::from_millis(50), &mut install).await;
        assert!(waited.is_err(), "install ran while another held the queue");
        assert!(lock(&harness.log).is_empty());

        drop(held);
        let outcome = install.await;
        assert!(!outcome.ok);
        assert_eq!(*lock(&harness.log), vec!["get dxvk-2.3".to_owned()]);
        harness.assert_gate_free();
    }

    #[test]
    fn in_use_components_are_not_removed() {
        let mut environments = MockEnvironments::default();
        environments.bottles.insert(
            "Gaming".into(),
            BottleConfig {
                name: "Gaming".into(),
                runner: "R1".into(),
                dxvk: "dxvk-2.3".into(),
                ..Default::default()
            },
        );
        let harness = Harness::with(Vec::new(), RepositoryIndex::new(), environments);
        let manager = &harness.manager;
        let runner = manager.paths().component_path(Category::Runner, "R1");
        fs::create_dir_all(&runner).unwrap();

        assert!(manager.is_in_use(Category::Runner, "R1"));
        assert!(manager.is_in_use(Category::Dxvk, "dxvk-2.3"));
        assert!(!manager.is_in_use(Category::Dxvk, "dxvk-2.2"));
        assert!(manager.is_in_use(Category::Runtime, "runtime-0.6"));
        assert!(manager.is_in_use(Category::WineBridge, "winebridge-0.1"));

        let outcome = manager.uninstall(Category::Runner, "R1");
        assert!(!outcome.ok);
        assert!(outcome.message.unwrap().contains("in use"));
        assert!(runner.is_dir());
        assert!(lock(&harness.log).is_empty());
    }

    #[test]
    fn uninstall_removes_unused_component() {
        let harness = Harness::new(Vec::new());
        let manager = &harness.manager;
        let dxvk = manager.paths().component_path(Category::Dxvk, "dxvk-2.2");
        fs::create_dir_all(dxvk.join("x64")).unwrap();

        assert_eq!(
            manager.uninstall(Category::Dxvk, "dxvk-2.2"),
            Outcome::success()
        );
        assert!(!dxvk.exists());
        assert_eq!(*lock(&harness.log), vec!["check dxvk".to_owned()]);

        let again = manager.uninstall(Category::Dxvk, "dxvk-2.2");
        assert!(!again.ok);
        assert!(again.message.unwrap().contains("not installed"));
    }

    #[test]
    fn catalog_merges_installed_state_and_is_memoized() {
        let index: RepositoryIndex = serde_json::from_str(
            r#"{
                "dxvk-2.3": {"Category": "dxvk", "Channel": "stable"},
                "dxvk-2.10": {"Category": "dxvk", "Channel": "stable"},
                "soda-7.0-9": {"Category": "runner", "Sub-category": "wine"},
                "ge-proton8-26": {"Category": "runner:proton", "Sub-category": "proton"}
            }"#,
        )
        .unwrap();
        let mut environments = MockEnvironments::default();
        environments
            .installed
            .insert(Category::Dxvk, vec!["dxvk-2.3".into()]);
        let harness = Harness::with(Vec::new(), index, environments);
        let manager = &harness.manager;

        harness.connection.0.store(false, Ordering::SeqCst);
        assert!(manager.fetch_catalog().is_empty());
        harness.connection.0.store(true, Ordering::SeqCst);

        let catalog = manager.fetch_catalog();
        let dxvk = catalog.category(Category::Dxvk);
        assert_eq!(dxvk[0].name, "dxvk-2.10");
        assert!(!dxvk[0].installed);
        assert!(dxvk[1].installed);
        assert_eq!(dxvk[1].fields["Channel"], "stable");
        assert_eq!(catalog.runners_by_sub_category()["proton"].len(), 1);

        assert_eq!(manager.fetch_catalog(), catalog);
        assert_eq!(harness.repository.catalog_calls.load(Ordering::SeqCst), 1);
        manager.invalidate_caches();
        manager.fetch_catalog();
        assert_eq!(harness.repository.catalog_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn manifests_are_memoized_until_invalidated() {
        let harness = Harness::new(vec![manifest(
            "dxvk-2.3",
            Category::Dxvk,
            "https://example.invalid/dxvk-2.3.tar.gz".into(),
            None,
        )]);
        let manager = &harness.manager;
        assert!(manager.get_component("dxvk-2.3").is_some());
        assert!(manager.get_component("dxvk-2.3").is_some());
        assert_eq!(lock(&harness.log).len(), 1);
        manager.invalidate_caches();
        assert!(manager.get_component("dxvk-2.3").is_some());
        assert_eq!(lock(&harness.log).len(), 2);
    }
}
