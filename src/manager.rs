//! Extension lifecycle manager.
//!
//! [`ExtensionManager`] discovers candidate files, runs one load job per file on a
//! bounded worker pool and keeps the registry of loaded instances.
//!
//! # Load jobs
//!
//! ```text
//! submit(file)
//!   └─ worker permit
//!        └─ blocking task
//!             ├─ read source (bundle: validate + extract libraries)
//!             ├─ checksum → duplicate check
//!             ├─ cache hit: load + verify header/checksum
//!             │  cache miss: resolve libraries → compile → save
//!             ├─ evaluate → extract
//!             ├─ register (atomic conflict check + insert)
//!             ├─ load hook
//!             └─ enable, if enable_all() is in effect
//! ```
//!
//! Every failure inside a job is logged with the file name and ends that job only.
//! The outcome is also delivered through the [`LoadTicket`] returned by
//! [`submit`](ExtensionManager::submit).
//!
//! # Enable chaining
//!
//! [`enable_all`](ExtensionManager::enable_all) enables every registered instance and
//! keeps enabling instances as their jobs complete, until
//! [`disable_all`](ExtensionManager::disable_all) is called.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ExtensionManager::new(&config)?;
//! manager.discover_and_load_all()?;
//! manager.enable_all();
//! manager.wait_idle().await;
//! for instance in manager.instances() {
//!     println!("{} {}", instance.id(), instance.name());
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::bundle::{self, Bundle};
use crate::cache::{self, CacheEntry, CacheStats, CacheStore, CACHE_EXTENSION};
use crate::config::{HostConfig, PathsConfig};
use crate::error::{Conflict, HostError, HostResult};
use crate::extension::{sanitize_dir_name, Extension, ExtensionContext};
use crate::instance::{CacheMetadata, ExtensionId, ExtensionInstance, ExtensionState};
use crate::resolver::DependencyResolver;
use crate::scripting::{ExtractionOutcome, ScriptCompiler, ScriptSource};

/// Input file kinds, dispatched by suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// `*.rhai`
    Script,
    /// `*.cache`, a cache entry used directly
    Precompiled,
    /// `*.rhai.zip`
    Bundle,
}

impl FileKind {
    /// Kind of `path`, or `None` if the suffix is not recognised.
    pub fn of(path: &Path) -> Option<Self> {
        if bundle::is_bundle(path) {
            return Some(FileKind::Bundle);
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("rhai") => Some(FileKind::Script),
            Some(CACHE_EXTENSION) => Some(FileKind::Precompiled),
            _ => None,
        }
    }
}

/// Handle on a submitted load job.
#[derive(Debug)]
pub struct LoadTicket {
    file: PathBuf,
    rx: oneshot::Receiver<HostResult<ExtensionId>>,
}

impl LoadTicket {
    /// File the job loads
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Wait for the job and return the id it registered.
    pub async fn outcome(self) -> HostResult<ExtensionId> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(HostError::JobFailed("load job was dropped".to_string())))
    }
}

/// Result of the compile-or-cache step.
struct Prepared {
    extension: Extension,
    outcome: ExtractionOutcome,
    provenance: CacheMetadata,
}

struct Inner {
    paths: PathsConfig,
    cache: CacheStore,
    resolver: DependencyResolver,
    compiler: Arc<ScriptCompiler>,
    registry: RwLock<BTreeMap<ExtensionId, Arc<ExtensionInstance>>>,
    pending: Mutex<HashSet<PathBuf>>,
    next_id: AtomicU64,
    in_flight: watch::Sender<usize>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    auto_enable: AtomicBool,
    accepting: AtomicBool,
    runtime: Handle,
}

/// Discovers, loads and tracks extensions. Cloning is cheap.
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<Inner>,
}

impl ExtensionManager {
    /// Manager using the Rhai toolchain.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &HostConfig) -> HostResult<Self> {
        Self::with_compiler(config, ScriptCompiler::rhai(config.loader.max_operations))
    }

    /// Manager using a caller-supplied compiler.
    pub fn with_compiler(config: &HostConfig, compiler: ScriptCompiler) -> HostResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| HostError::JobFailed(format!("no async runtime: {}", e)))?;
        let paths = config.paths.clone();
        paths.ensure_dirs()?;

        let worker_count = config.loader.worker_count();
        let (in_flight, _) = watch::channel(0usize);
        info!(
            plugins = %paths.plugins_dir().display(),
            workers = worker_count,
            "Extension manager ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                cache: CacheStore::new(paths.cache_dir()),
                resolver: DependencyResolver::new(paths.lib_dir()),
                paths,
                compiler: Arc::new(compiler),
                registry: RwLock::new(BTreeMap::new()),
                pending: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(0),
                in_flight,
                workers: Arc::new(Semaphore::new(worker_count)),
                worker_count,
                auto_enable: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
                runtime,
            }),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Directory layout
    pub fn paths(&self) -> &PathsConfig {
        &self.inner.paths
    }

    /// Compiler shared by all load jobs
    pub fn compiler(&self) -> &ScriptCompiler {
        &self.inner.compiler
    }

    /// Artifact cache
    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Size of the load worker pool
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Registered instances ordered by id.
    pub fn instances(&self) -> Vec<Arc<ExtensionInstance>> {
        self.inner.read_registry().values().cloned().collect()
    }

    /// Instance registered under `id`, if any.
    pub fn get(&self, id: ExtensionId) -> Option<Arc<ExtensionInstance>> {
        self.inner.read_registry().get(&id).cloned()
    }

    /// Number of registered instances
    pub fn len(&self) -> usize {
        self.inner.read_registry().len()
    }

    /// Whether no instance is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files whose load job has not finished.
    pub fn pending_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = self.inner.lock_pending().iter().cloned().collect();
        files.sort();
        files
    }

    /// Size of the cache directory.
    pub fn cache_stats(&self) -> std::io::Result<CacheStats> {
        self.inner.cache.stats()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Submit every candidate file in the plugins directory.
    ///
    /// Returns the number of jobs submitted.
    ///
    /// # Errors
    ///
    /// `NotADirectory` if the plugins path is not a directory; nothing is loaded.
    pub fn discover_and_load_all(&self) -> HostResult<usize> {
        let dir = self.inner.paths.plugins_dir();
        if !dir.is_dir() {
            error!(path = %dir.display(), "Plugins path is not a directory");
            return Err(HostError::NotADirectory(dir));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && FileKind::of(path).is_some())
            .collect();
        files.sort();

        let submitted = files.iter().filter(|file| self.load_one(file)).count();
        info!(
            found = files.len(),
            submitted,
            "Discovered extension files in {}",
            dir.display()
        );
        Ok(submitted)
    }

    /// Submit a load job for `file`.
    ///
    /// `true` means the job was accepted, not that the load will succeed.
    pub fn load_one(&self, file: impl AsRef<Path>) -> bool {
        match self.submit(file.as_ref()) {
            Ok(_) => true,
            Err(e) => {
                warn!(file = %file.as_ref().display(), "Load rejected: {}", e);
                false
            }
        }
    }

    /// Submit a load job for `file` and return a ticket for its outcome.
    ///
    /// # Errors
    ///
    /// `ShuttingDown`, `UnsupportedFile` for missing files and unknown suffixes,
    /// `AlreadyLoaded` if the file is registered or still loading.
    pub fn submit(&self, file: impl AsRef<Path>) -> HostResult<LoadTicket> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(HostError::ShuttingDown);
        }

        let file = std::path::absolute(file.as_ref())?;
        let kind = FileKind::of(&file)
            .filter(|_| file.is_file())
            .ok_or_else(|| HostError::UnsupportedFile(file.clone()))?;

        {
            // A job inserts into the registry before it leaves `pending`, so
            // holding `pending` across both checks leaves no gap.
            let mut pending = inner.lock_pending();
            if inner.read_registry().values().any(|i| i.file() == file)
                || !pending.insert(file.clone())
            {
                return Err(HostError::AlreadyLoaded(file));
            }
        }
        inner.in_flight.send_modify(|n| *n += 1);

        info!(file = %display_name(&file), "Loading extension");
        let (tx, rx) = oneshot::channel();
        let job_inner = Arc::clone(inner);
        let job_file = file.clone();
        inner.runtime.spawn(async move {
            let result = Inner::run_job(Arc::clone(&job_inner), job_file.clone(), kind).await;
            if let Err(e) = &result {
                error!(file = %display_name(&job_file), "Failed to load extension: {}", e);
            }
            job_inner.finish(&job_file);
            let _ = tx.send(result);
        });

        Ok(LoadTicket { file, rx })
    }

    /// Compile a script or bundle into the cache without loading it.
    pub async fn precompile(&self, file: impl AsRef<Path>) -> HostResult<CacheMetadata> {
        let file = std::path::absolute(file.as_ref())?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let source = inner.read_source(&file)?;
            let header = inner.compiler.header()?;
            let (entry, fresh_compile, path) = inner.compile_or_reuse(&source, &header)?;
            Ok(CacheMetadata {
                fresh_compile,
                header: entry.header,
                origin: entry.origin,
                checksum: entry.checksum,
                file: path,
            })
        })
        .await
        .map_err(|e| HostError::JobFailed(e.to_string()))?
    }

    /// Wait until no load job is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Enable every loaded instance and every instance still loading once it is
    /// registered. Returns the number enabled now.
    pub fn enable_all(&self) -> usize {
        self.inner.auto_enable.store(true, Ordering::SeqCst);
        self.instances()
            .iter()
            .filter(|i| i.state() != ExtensionState::Loading)
            .filter(|i| match i.enable() {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(id = i.id(), "{}", e);
                    false
                }
            })
            .count()
    }

    /// Disable every instance and stop chaining enable onto completing loads.
    /// Returns the number disabled.
    pub fn disable_all(&self) -> usize {
        self.inner.auto_enable.store(false, Ordering::SeqCst);
        self.instances()
            .iter()
            .filter(|i| matches!(i.disable(), Ok(true)))
            .count()
    }

    /// Enable one instance. `Ok(false)` if it was already enabled.
    pub fn enable_one(&self, id: ExtensionId) -> HostResult<bool> {
        self.instance(id)?.enable()
    }

    /// Disable one instance. `Ok(false)` if it was not enabled.
    pub fn disable_one(&self, id: ExtensionId) -> HostResult<bool> {
        self.instance(id)?.disable()
    }

    /// Disable, run the unload hook, then drop the instance from the registry.
    pub fn unload_one(&self, id: ExtensionId) -> HostResult<()> {
        let instance = self.instance(id)?;
        instance.unload();
        self.inner
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }

    /// Stop accepting loads, let running jobs finish, then disable everything.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.auto_enable.store(false, Ordering::SeqCst);
        self.wait_idle().await;
        let disabled = self.disable_all();
        info!(
            instances = self.len(),
            disabled,
            "Extension manager shut down"
        );
    }

    fn instance(&self, id: ExtensionId) -> HostResult<Arc<ExtensionInstance>> {
        self.get(id).ok_or(HostError::UnknownExtension(id))
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("plugins", &self.inner.paths.plugins_dir())
            .field("instances", &self.len())
            .field("workers", &self.inner.worker_count)
            .finish()
    }
}

// =============================================================================
// Job internals
// =============================================================================

impl Inner {
    fn read_registry(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<ExtensionId, Arc<ExtensionInstance>>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, file: &Path) {
        self.lock_pending().remove(file);
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn run_job(self: Arc<Self>, file: PathBuf, kind: FileKind) -> HostResult<ExtensionId> {
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|e| HostError::JobFailed(e.to_string()))?;
        tokio::task::spawn_blocking(move || self.load_blocking(file, kind))
            .await
            .map_err(|e| HostError::JobFailed(e.to_string()))?
    }

    fn load_blocking(&self, file: PathBuf, kind: FileKind) -> HostResult<ExtensionId> {
        let start = Instant::now();
        let prepared = self.prepare(&file, kind)?;
        let via = if prepared.provenance.fresh_compile {
            "compile"
        } else {
            "cache"
        };
        debug!(
            file = %display_name(&file),
            via,
            outcome = ?prepared.outcome,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Extension evaluated"
        );

        let instance = self.register(file, prepared, start)?;
        instance.load();
        if self.auto_enable.load(Ordering::SeqCst) {
            if let Err(e) = instance.enable() {
                warn!(id = instance.id(), "Chained enable skipped: {}", e);
            }
        }
        Ok(instance.id())
    }

    fn read_source(&self, file: &Path) -> HostResult<ScriptSource> {
        match FileKind::of(file) {
            Some(FileKind::Script) => Ok(ScriptSource::read(file)?),
            Some(FileKind::Bundle) => {
                let bundle = Bundle::open(file)?;
                let source = bundle.source();
                bundle.extract_libraries(&self.resolver.library_root(source.namespace()))?;
                Ok(source)
            }
            _ => Err(HostError::UnsupportedFile(file.to_path_buf())),
        }
    }

    fn prepare(&self, file: &Path, kind: FileKind) -> HostResult<Prepared> {
        let header = self.compiler.header()?;

        let (entry, fresh_compile, cache_file) = match kind {
            FileKind::Precompiled => {
                let entry = self.load_entry(file, &header)?;
                // Only checksum-named entries can be checked against their name.
                if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                    if cache::is_checksum(stem) && stem != entry.checksum {
                        return Err(HostError::ChecksumMismatch {
                            path: file.to_path_buf(),
                            stored: entry.checksum,
                            actual: stem.to_string(),
                        });
                    }
                }
                (entry, false, file.to_path_buf())
            }
            FileKind::Script | FileKind::Bundle => {
                let source = self.read_source(file)?;
                self.compile_or_reuse(&source, &header)?
            }
        };

        let evaluation = self.compiler.evaluate(&entry.artifact, &display_name(file))?;
        let extracted = ScriptCompiler::extract(evaluation)?;

        Ok(Prepared {
            extension: extracted.extension,
            outcome: extracted.outcome,
            provenance: CacheMetadata {
                fresh_compile,
                header: entry.header,
                origin: entry.origin,
                checksum: entry.checksum,
                file: cache_file,
            },
        })
    }

    /// Reuse the cache entry for `source` or compile and save a new one.
    fn compile_or_reuse(
        &self,
        source: &ScriptSource,
        header: &str,
    ) -> HostResult<(CacheEntry, bool, PathBuf)> {
        let checksum = cache::checksum(source.text().as_bytes());
        if let Some(existing) = self.find_conflict(None, &checksum) {
            return Err(existing);
        }

        let cache_file = self.cache.locate(&checksum);
        if cache_file.exists() {
            let entry = self.load_entry(&cache_file, header)?;
            if entry.checksum != checksum {
                return Err(HostError::ChecksumMismatch {
                    path: cache_file,
                    stored: entry.checksum,
                    actual: checksum,
                });
            }
            return Ok((entry, false, cache_file));
        }

        let resolution =
            self.resolver
                .resolve(source.namespace(), source.libraries(), &source.label());
        for missing in &resolution.errors {
            warn!("{}", missing);
        }

        let artifact = self.compiler.compile(source, &resolution.classpath)?;
        let entry = self
            .cache
            .save(artifact, &cache_file, source.origin(), &checksum, header)?;
        Ok((entry, true, cache_file))
    }

    fn load_entry(&self, path: &Path, header: &str) -> HostResult<CacheEntry> {
        let entry = self.cache.load(path)?;
        if !CacheStore::verify_header(&entry, header) {
            return Err(HostError::HeaderMismatch {
                path: path.to_path_buf(),
                found: entry.header,
                expected: header.to_string(),
            });
        }
        Ok(entry)
    }

    /// Conflict with a registered instance by name (when given) or checksum.
    fn find_conflict(&self, name: Option<&str>, checksum: &str) -> Option<HostError> {
        find_conflict(&self.read_registry(), name, checksum)
    }

    fn register(
        &self,
        file: PathBuf,
        prepared: Prepared,
        start: Instant,
    ) -> HostResult<Arc<ExtensionInstance>> {
        let (descriptor, hooks) = prepared.extension.into_parts();
        let data_dir = self
            .paths
            .data_dir()
            .join(sanitize_dir_name(&descriptor.name));

        let instance = {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            if let Some(conflict) = find_conflict(
                &registry,
                Some(&descriptor.name),
                &prepared.provenance.checksum,
            ) {
                return Err(conflict);
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let context =
                ExtensionContext::new(id, &descriptor.name, data_dir, self.runtime.clone());
            let instance = Arc::new(ExtensionInstance::new(
                descriptor,
                hooks,
                file,
                prepared.provenance,
                start.elapsed(),
                context,
            ));
            registry.insert(id, Arc::clone(&instance));
            instance
        };

        if let Err(e) = std::fs::create_dir_all(instance.data_dir()) {
            warn!(id = instance.id(), "Cannot create data directory: {}", e);
        }
        info!(
            id = instance.id(),
            extension = %instance.name(),
            version = %instance.descriptor().version,
            file = %instance.file_name(),
            "Extension registered"
        );
        Ok(instance)
    }
}

fn find_conflict(
    registry: &BTreeMap<ExtensionId, Arc<ExtensionInstance>>,
    name: Option<&str>,
    checksum: &str,
) -> Option<HostError> {
    registry.values().find_map(|existing| {
        let conflict = if name == Some(existing.name()) {
            Conflict::Name(existing.name().to_string())
        } else if existing.provenance().checksum == checksum {
            Conflict::Checksum(checksum.to_string())
        } else {
            return None;
        };
        Some(HostError::DuplicateExtension {
            existing: existing.file_name(),
            conflict,
        })
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
