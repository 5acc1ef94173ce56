//! Extension instances and their lifecycle state machine.
//!
//! ```text
//! Loading ──load hook──► Loaded
//! Loaded ──enable──► Enabled ◄──enable── Disabled
//!                       │                   ▲
//!                       └──────disable──────┘
//! any live state ──unload──► Unloading ──► Unloaded (terminal)
//! ```
//!
//! Transitions on one instance are serialised by its state lock; the hook for a
//! transition runs while the lock is held. Hook failures are logged and the
//! transition still completes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{HostError, HostResult};
use crate::extension::{ExtensionContext, ExtensionDescriptor, Hook, LifecycleHooks};

/// Registry identity of an instance. Never reused.
pub type ExtensionId = u64;

/// Lifecycle state of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtensionState {
    /// Registered, load hook not finished yet
    Loading,
    /// Registered, load hook run
    Loaded,
    /// Inside an enable session
    Enabled,
    /// Enable session ended
    Disabled,
    /// Unload hook running
    Unloading,
    /// Removed from the registry
    Unloaded,
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtensionState::Loading => "loading",
            ExtensionState::Loaded => "loaded",
            ExtensionState::Enabled => "enabled",
            ExtensionState::Disabled => "disabled",
            ExtensionState::Unloading => "unloading",
            ExtensionState::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// Where an instance's artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetadata {
    /// Compiled during this load, as opposed to read from the cache
    pub fresh_compile: bool,
    /// Cache header
    pub header: String,
    /// Absolute path of the source that was compiled
    pub origin: PathBuf,
    /// Source checksum
    pub checksum: String,
    /// Cache entry file
    pub file: PathBuf,
}

/// A registered extension.
pub struct ExtensionInstance {
    id: ExtensionId,
    descriptor: ExtensionDescriptor,
    hooks: LifecycleHooks,
    file: PathBuf,
    provenance: CacheMetadata,
    loaded_at: DateTime<Utc>,
    load_duration: Duration,
    state: Mutex<ExtensionState>,
    context: ExtensionContext,
}

impl ExtensionInstance {
    pub(crate) fn new(
        descriptor: ExtensionDescriptor,
        hooks: LifecycleHooks,
        file: PathBuf,
        provenance: CacheMetadata,
        load_duration: Duration,
        context: ExtensionContext,
    ) -> Self {
        Self {
            id: context.id(),
            descriptor,
            hooks,
            file,
            provenance,
            loaded_at: Utc::now(),
            load_duration,
            state: Mutex::new(ExtensionState::Loading),
            context,
        }
    }

    /// Registry id
    pub fn id(&self) -> ExtensionId {
        self.id
    }

    /// Declared extension name
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Declared metadata
    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    /// File the instance was loaded from
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// File name used in messages
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// How the artifact was obtained and where it is cached.
    pub fn provenance(&self) -> &CacheMetadata {
        &self.provenance
    }

    /// Private data directory
    pub fn data_dir(&self) -> &Path {
        self.context.data_dir()
    }

    /// Registration time
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Time from job start to registration
    pub fn load_duration(&self) -> Duration {
        self.load_duration
    }

    /// Context handed to lifecycle hooks
    pub fn context(&self) -> &ExtensionContext {
        &self.context
    }

    /// Current lifecycle state
    pub fn state(&self) -> ExtensionState {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ExtensionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_hook(&self, stage: &'static str, hook: &Option<Hook>) {
        let Some(hook) = hook else {
            return;
        };
        debug!(id = self.id, extension = %self.name(), stage, "Running hook");
        if let Err(e) = hook(&self.context) {
            error!(
                id = self.id,
                extension = %self.name(),
                file = %self.file_name(),
                stage,
                "Hook failed: {:#}",
                e
            );
        }
    }

    /// Run the load hook and enter `Loaded`.
    pub(crate) fn load(&self) {
        let mut state = self.lock();
        if *state == ExtensionState::Loading {
            self.run_hook("load", &self.hooks.on_load);
            *state = ExtensionState::Loaded;
        }
    }

    /// Enter `Enabled`. Returns `false` if already enabled.
    pub fn enable(&self) -> HostResult<bool> {
        let mut state = self.lock();
        match *state {
            ExtensionState::Enabled => Ok(false),
            ExtensionState::Loaded | ExtensionState::Disabled => {
                self.context.begin_session();
                self.run_hook("enable", &self.hooks.on_enable);
                *state = ExtensionState::Enabled;
                info!(id = self.id, extension = %self.name(), "Extension enabled");
                Ok(true)
            }
            other => Err(self.invalid("enable", other)),
        }
    }

    /// Leave `Enabled`, cancelling session work. Returns `false` if not enabled.
    pub fn disable(&self) -> HostResult<bool> {
        let mut state = self.lock();
        match *state {
            ExtensionState::Enabled => {
                self.disable_locked(&mut state);
                Ok(true)
            }
            ExtensionState::Loaded | ExtensionState::Disabled => Ok(false),
            other => Err(self.invalid("disable", other)),
        }
    }

    fn disable_locked(&self, state: &mut ExtensionState) {
        self.run_hook("disable", &self.hooks.on_disable);
        self.context.end_session();
        *state = ExtensionState::Disabled;
        info!(id = self.id, extension = %self.name(), "Extension disabled");
    }

    /// Disable if needed, run the unload hook and cancel everything the instance
    /// started. Idempotent once `Unloaded`.
    pub(crate) fn unload(&self) {
        let mut state = self.lock();
        match *state {
            ExtensionState::Unloading | ExtensionState::Unloaded => return,
            ExtensionState::Enabled => self.disable_locked(&mut state),
            ExtensionState::Loading | ExtensionState::Loaded | ExtensionState::Disabled => {}
        }
        *state = ExtensionState::Unloading;
        self.run_hook("unload", &self.hooks.on_unload);
        self.context.close();
        *state = ExtensionState::Unloaded;
        info!(id = self.id, extension = %self.name(), "Extension unloaded");
    }

    fn invalid(&self, action: &'static str, state: ExtensionState) -> HostError {
        HostError::InvalidState {
            name: self.name().to_string(),
            action,
            state: state.to_string(),
        }
    }
}

impl fmt::Debug for ExtensionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionInstance")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("file", &self.file)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Extension;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        load: AtomicUsize,
        enable: AtomicUsize,
        disable: AtomicUsize,
        unload: AtomicUsize,
    }

    fn instance(counters: Arc<Counters>) -> ExtensionInstance {
        let (c1, c2, c3, c4) = (
            counters.clone(),
            counters.clone(),
            counters.clone(),
            counters,
        );
        let (descriptor, hooks) = Extension::builder("Counter")
            .on_load(move |_| {
                c1.load.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_enable(move |_| {
                c2.enable.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_disable(move |_| {
                c3.disable.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_unload(move |_| {
                c4.unload.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("unload hooks may fail")
            })
            .build()
            .into_parts();
        let context = ExtensionContext::new(
            7,
            "Counter",
            PathBuf::from("data/Counter"),
            tokio::runtime::Handle::current(),
        );
        ExtensionInstance::new(
            descriptor,
            hooks,
            PathBuf::from("plugins/counter.rhai"),
            CacheMetadata {
                fresh_compile: true,
                header: "PHC1/test".into(),
                origin: PathBuf::from("/plugins/counter.rhai"),
                checksum: "00".into(),
                file: PathBuf::from("cache/00.cache"),
            },
            Duration::from_millis(3),
            context,
        )
    }

    #[tokio::test]
    async fn test_enable_disable_idempotent() {
        let counters = Arc::new(Counters::default());
        let inst = instance(counters.clone());
        assert_eq!(inst.id(), 7);
        assert_eq!(inst.state(), ExtensionState::Loading);
        assert!(inst.enable().is_err());

        inst.load();
        inst.load();
        assert_eq!(inst.state(), ExtensionState::Loaded);
        assert!(inst.enable().unwrap());
        assert!(!inst.enable().unwrap());
        assert_eq!(counters.enable.load(Ordering::SeqCst), 1);
        assert_eq!(inst.state(), ExtensionState::Enabled);
        assert!(inst.context().is_active());

        assert!(inst.disable().unwrap());
        assert!(!inst.disable().unwrap());
        assert_eq!(counters.disable.load(Ordering::SeqCst), 1);
        assert_eq!(inst.state(), ExtensionState::Disabled);
        assert!(!inst.context().is_active());

        assert!(inst.enable().unwrap());
        assert_eq!(counters.enable.load(Ordering::SeqCst), 2);
        assert_eq!(counters.load.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unload_disables_first() {
        let counters = Arc::new(Counters::default());
        let inst = instance(counters.clone());
        inst.load();
        inst.enable().unwrap();

        inst.unload();
        assert_eq!(inst.state(), ExtensionState::Unloaded);
        assert_eq!(counters.disable.load(Ordering::SeqCst), 1);
        assert_eq!(counters.unload.load(Ordering::SeqCst), 1);

        inst.unload();
        assert_eq!(counters.unload.load(Ordering::SeqCst), 1);
        assert!(matches!(
            inst.enable(),
            Err(HostError::InvalidState { action: "enable", .. })
        ));
    }

    #[tokio::test]
    async fn test_unload_from_loaded_skips_disable() {
        let counters = Arc::new(Counters::default());
        let inst = instance(counters.clone());
        inst.unload();
        assert_eq!(counters.disable.load(Ordering::SeqCst), 0);
        assert_eq!(counters.unload.load(Ordering::SeqCst), 1);
    }
}
