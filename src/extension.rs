//! Extension values and the context they run in.
//!
//! An [`Extension`] is what a script evaluates to: a static [`ExtensionDescriptor`]
//! plus optional [`LifecycleHooks`]. Scripts build one through [`ExtensionBuilder`]:
//!
//! ```rust
//! use plugin_host::extension::Extension;
//!
//! let ext = Extension::builder("Echo")
//!     .version("1.2.0")
//!     .author("someone")
//!     .on_enable(|ctx| {
//!         ctx.logger().info("ready");
//!         Ok(())
//!     })
//!     .build();
//! assert_eq!(ext.descriptor().website, "");
//! ```
//!
//! Hooks receive an [`ExtensionContext`], the per-instance handle to the data
//! directory, the logger and the background task scope.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::logging::EXTENSION_TARGET;

/// Author-supplied static metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDescriptor {
    /// Declared name, unique among loaded extensions
    pub name: String,
    /// Version string, `"unknown"` if not declared
    pub version: String,
    /// Author, `"unknown"` if not declared
    pub author: String,
    /// Homepage, empty if not declared
    pub website: String,
}

impl ExtensionDescriptor {
    /// Descriptor with only a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "unknown".to_string(),
            author: "unknown".to_string(),
            website: String::new(),
        }
    }
}

/// A lifecycle callback.
pub type Hook = Arc<dyn Fn(&ExtensionContext) -> anyhow::Result<()> + Send + Sync>;

/// Optional callbacks for each lifecycle transition.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    /// After registration
    pub on_load: Option<Hook>,
    /// On every transition into `Enabled`
    pub on_enable: Option<Hook>,
    /// On every transition out of `Enabled`
    pub on_disable: Option<Hook>,
    /// Once, before the instance leaves the registry
    pub on_unload: Option<Hook>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_load", &self.on_load.is_some())
            .field("on_enable", &self.on_enable.is_some())
            .field("on_disable", &self.on_disable.is_some())
            .field("on_unload", &self.on_unload.is_some())
            .finish()
    }
}

/// The value a script must produce to be loadable.
#[derive(Clone, Debug)]
pub struct Extension {
    descriptor: ExtensionDescriptor,
    hooks: LifecycleHooks,
}

impl Extension {
    /// Start building an extension called `name`.
    pub fn builder(name: impl Into<String>) -> ExtensionBuilder {
        ExtensionBuilder {
            descriptor: ExtensionDescriptor::new(name),
            hooks: LifecycleHooks::default(),
        }
    }

    /// Static metadata
    pub fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    /// Lifecycle callbacks
    pub fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }

    /// Split into descriptor and hooks.
    pub fn into_parts(self) -> (ExtensionDescriptor, LifecycleHooks) {
        (self.descriptor, self.hooks)
    }
}

/// Fluent constructor for [`Extension`].
#[must_use]
pub struct ExtensionBuilder {
    descriptor: ExtensionDescriptor,
    hooks: LifecycleHooks,
}

impl ExtensionBuilder {
    /// Set the version string.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.descriptor.version = version.into();
        self
    }

    /// Set the author.
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.descriptor.author = author.into();
        self
    }

    /// Set the homepage.
    pub fn website(mut self, website: impl Into<String>) -> Self {
        self.descriptor.website = website.into();
        self
    }

    /// Callback run once after registration.
    pub fn on_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_load = Some(Arc::new(hook));
        self
    }

    /// Callback run on enable.
    pub fn on_enable<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_enable = Some(Arc::new(hook));
        self
    }

    /// Callback run on disable.
    pub fn on_disable<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_disable = Some(Arc::new(hook));
        self
    }

    /// Callback run on unload.
    pub fn on_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ExtensionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.on_unload = Some(Arc::new(hook));
        self
    }

    /// Finish the extension.
    pub fn build(self) -> Extension {
        Extension {
            descriptor: self.descriptor,
            hooks: self.hooks,
        }
    }
}

// =============================================================================
// Logger
// =============================================================================

/// Per-instance logger, emitting on the `plugin_host::extension` target.
#[derive(Debug, Clone)]
pub struct ExtensionLogger {
    name: Arc<str>,
}

impl ExtensionLogger {
    /// Logger tagged with the extension name.
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    /// Log at debug level.
    pub fn debug(&self, message: &str) {
        tracing::debug!(target: EXTENSION_TARGET, extension = %self.name, "{}", message);
    }

    /// Log at info level.
    pub fn info(&self, message: &str) {
        tracing::info!(target: EXTENSION_TARGET, extension = %self.name, "{}", message);
    }

    /// Log at warn level.
    pub fn warn(&self, message: &str) {
        tracing::warn!(target: EXTENSION_TARGET, extension = %self.name, "{}", message);
    }

    /// Log at error level.
    pub fn error(&self, message: &str) {
        tracing::error!(target: EXTENSION_TARGET, extension = %self.name, "{}", message);
    }
}

// =============================================================================
// Context
// =============================================================================

/// Handle passed to lifecycle hooks.
///
/// Background work started through [`spawn`](Self::spawn) belongs to the current
/// enable session and is cancelled when the instance is disabled. Cloning is cheap.
#[derive(Clone)]
pub struct ExtensionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: u64,
    name: String,
    data_dir: PathBuf,
    logger: ExtensionLogger,
    runtime: Handle,
    root: CancellationToken,
    session: Mutex<CancellationToken>,
}

impl ExtensionContext {
    pub(crate) fn new(id: u64, name: &str, data_dir: PathBuf, runtime: Handle) -> Self {
        let root = CancellationToken::new();
        let session = root.child_token();
        // Nothing runs before the first enable.
        session.cancel();
        Self {
            inner: Arc::new(ContextInner {
                id,
                name: name.to_string(),
                data_dir,
                logger: ExtensionLogger::new(name),
                runtime,
                root,
                session: Mutex::new(session),
            }),
        }
    }

    /// Registry identity of the instance
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Declared extension name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Private data directory (`data/<name>/`)
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Logger tagged with this extension
    pub fn logger(&self) -> &ExtensionLogger {
        &self.inner.logger
    }

    /// Token cancelled when the current enable session ends.
    pub fn session_token(&self) -> CancellationToken {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the instance is inside an enable session.
    pub fn is_active(&self) -> bool {
        !self.session_token().is_cancelled()
    }

    /// Run `future` until it completes or the enable session ends.
    ///
    /// Returns `None` when called outside an enable session.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.session_token();
        if token.is_cancelled() {
            self.inner
                .logger
                .warn("Background task refused: extension is not enabled");
            return None;
        }
        Some(self.inner.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = future => {}
            }
        }))
    }

    pub(crate) fn begin_session(&self) {
        let mut session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
        *session = self.inner.root.child_token();
    }

    pub(crate) fn end_session(&self) {
        self.session_token().cancel();
    }

    pub(crate) fn close(&self) {
        self.inner.root.cancel();
    }
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("data_dir", &self.inner.data_dir)
            .finish()
    }
}

/// Directory-safe form of an extension name.
pub fn sanitize_dir_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}
