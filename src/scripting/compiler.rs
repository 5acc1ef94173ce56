//! Shared compiler service.
//!
//! [`ScriptCompiler`] owns the one toolchain instance used by every load job. The
//! toolchain is created on first use and then reused. All compile and evaluate
//! calls pass through a single guard, so load jobs may resolve dependencies and
//! touch the cache in parallel while the toolchain only ever sees one caller.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use super::directives::ScriptSource;
use super::rhai_engine::RhaiToolchain;
use super::script_engine::{
    CompiledArtifact, Evaluation, EvaluationContext, ScriptError, ScriptToolchain,
};
use crate::error::{HostError, HostResult, SourceLocation};
use crate::extension::Extension;

/// Prefix of every cache header; bump when the cache layout changes.
pub const HEADER_PREFIX: &str = "PHC1";

type ToolchainFactory =
    Box<dyn Fn() -> Result<Arc<dyn ScriptToolchain>, ScriptError> + Send + Sync>;

/// How the extension value was found in an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// The script's final expression
    Returned,
    /// The single top-level binding holding an extension
    Declared {
        /// Name of that binding
        binding: String,
    },
}

/// Extension value pulled out of an evaluation.
#[derive(Debug)]
pub struct Extracted {
    /// The extension itself
    pub extension: Extension,
    /// Whether it was returned or found among declarations
    pub outcome: ExtractionOutcome,
}

/// Lazily initialised, serialised access to a [`ScriptToolchain`].
pub struct ScriptCompiler {
    factory: ToolchainFactory,
    toolchain: OnceCell<Arc<dyn ScriptToolchain>>,
    guard: Mutex<()>,
}

impl ScriptCompiler {
    /// Compiler that builds its toolchain with `factory` on first use.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ScriptToolchain>, ScriptError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            toolchain: OnceCell::new(),
            guard: Mutex::new(()),
        }
    }

    /// Compiler backed by the Rhai toolchain.
    pub fn rhai(max_operations: u64) -> Self {
        Self::new(move || {
            Ok(Arc::new(RhaiToolchain::with_limit(max_operations)) as Arc<dyn ScriptToolchain>)
        })
    }

    /// Compiler around an existing toolchain.
    pub fn with_toolchain(toolchain: Arc<dyn ScriptToolchain>) -> Self {
        Self::new(move || Ok(Arc::clone(&toolchain)))
    }

    fn toolchain(&self) -> HostResult<&Arc<dyn ScriptToolchain>> {
        self.toolchain
            .get_or_try_init(|| {
                let start = Instant::now();
                let toolchain = (self.factory)()?;
                info!(
                    toolchain = toolchain.id(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Script toolchain initialised"
                );
                Ok::<_, ScriptError>(toolchain)
            })
            .map_err(HostError::from)
    }

    /// Whether the toolchain has been created yet.
    pub fn is_initialized(&self) -> bool {
        self.toolchain.get().is_some()
    }

    /// Header every cache entry produced by this compiler carries.
    pub fn header(&self) -> HostResult<String> {
        Ok(format!("{}/{}", HEADER_PREFIX, self.toolchain()?.id()))
    }

    /// Compile `source` with the resolved `classpath`.
    pub fn compile(
        &self,
        source: &ScriptSource,
        classpath: &[PathBuf],
    ) -> HostResult<CompiledArtifact> {
        let toolchain = self.toolchain()?;
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        debug!(script = %source.label(), libraries = classpath.len(), "Compiling");
        Ok(toolchain.compile(source, classpath)?)
    }

    /// Run the top-level code of `artifact`.
    pub fn evaluate(&self, artifact: &CompiledArtifact, label: &str) -> HostResult<Evaluation> {
        let toolchain = self.toolchain()?;
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        Ok(toolchain.evaluate(artifact, &EvaluationContext::new(label))?)
    }

    /// Find the single extension value an evaluation produced.
    ///
    /// A returned extension wins. Otherwise exactly one top-level binding must
    /// hold an extension.
    pub fn extract(evaluation: Evaluation) -> HostResult<Extracted> {
        if let Some(returned) = evaluation.returned {
            if returned.is::<Extension>() {
                let extension = returned.downcast::<Extension>()?;
                return Ok(Extracted {
                    extension,
                    outcome: ExtractionOutcome::Returned,
                });
            }
            debug!(
                returned = returned.type_name(),
                "Returned value is not an extension, scanning declarations"
            );
        }

        let mut candidates: Vec<_> = evaluation
            .declarations
            .into_iter()
            .filter(|(_, value)| value.is::<Extension>())
            .collect();

        match candidates.len() {
            0 => Err(HostError::ExtensionNotFound),
            1 => {
                let (binding, value) = candidates.remove(0);
                Ok(Extracted {
                    extension: value.downcast::<Extension>()?,
                    outcome: ExtractionOutcome::Declared { binding },
                })
            }
            count => Err(HostError::AmbiguousExtension { count }),
        }
    }
}

impl std::fmt::Debug for ScriptCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCompiler")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl From<ScriptError> for HostError {
    fn from(error: ScriptError) -> Self {
        match error {
            ScriptError::Compilation {
                message,
                line,
                column,
            } => HostError::Compile {
                message,
                location: line.map(|line| SourceLocation { line, column }),
            },
            ScriptError::Runtime { message } => HostError::Evaluation(message),
            ScriptError::Artifact { message } => {
                HostError::Evaluation(format!("unusable artifact: {}", message))
            }
            ScriptError::Backend { backend, message } => HostError::Compile {
                message: format!("{} backend: {}", backend, message),
                location: None,
            },
        }
    }
}
