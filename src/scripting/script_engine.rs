//! Toolchain Abstraction
//!
//! This module defines the contract between the extension host and whatever
//! compiles and runs extension scripts. The host never looks inside a compiled
//! artifact or a script value; it only hands sources in and takes results out.
//!
//! # Architecture
//!
//! ```text
//! ScriptToolchain trait
//!     └── RhaiToolchain (embedded, default)
//! ```
//!
//! A toolchain is driven through [`ScriptCompiler`](super::ScriptCompiler), which
//! creates it lazily and serialises access to it. Implementations may therefore
//! keep internal state that is not reentrant.
//!
//! # Example
//!
//! ```rust,ignore
//! let toolchain = RhaiToolchain::with_limit(100_000);
//! let artifact = toolchain.compile(&source, &classpath)?;
//! let evaluation = toolchain.evaluate(&artifact, &EvaluationContext::new("foo.rhai"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use super::directives::ScriptSource;

// =============================================================================
// ScriptError - Toolchain-level errors
// =============================================================================

/// Errors reported by a toolchain
///
/// These are converted into [`HostError`](crate::error::HostError) at the compiler
/// boundary and never reach the lifecycle manager in this form.
#[derive(Debug, Clone)]
pub enum ScriptError {
    /// Source could not be parsed or linked
    Compilation {
        message: String,
        line: Option<usize>,
        column: Option<usize>,
    },

    /// Top-level script code raised an error
    Runtime { message: String },

    /// A compiled artifact could not be decoded or belongs to another toolchain
    Artifact { message: String },

    /// The toolchain itself failed (initialisation, I/O while reading libraries)
    Backend { backend: String, message: String },
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Compilation {
                message,
                line,
                column,
            } => {
                write!(f, "Compilation error: {}", message)?;
                if let Some(line) = line {
                    write!(f, " at line {}", line)?;
                }
                if let Some(col) = column {
                    write!(f, ", column {}", col)?;
                }
                Ok(())
            }
            ScriptError::Runtime { message } => write!(f, "Runtime error: {}", message),
            ScriptError::Artifact { message } => write!(f, "Invalid artifact: {}", message),
            ScriptError::Backend { backend, message } => {
                write!(f, "{} backend error: {}", backend, message)
            }
        }
    }
}

impl std::error::Error for ScriptError {}

// =============================================================================
// CompiledArtifact
// =============================================================================

/// Opaque result of compiling a script.
///
/// `toolchain` names the producer so an artifact is never handed to a toolchain
/// that cannot read it; `payload` is private to that toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    /// Identifier of the toolchain that produced the payload
    pub toolchain: String,
    /// Toolchain-private bytes
    pub payload: Vec<u8>,
}

// =============================================================================
// ScriptValue - Type-Erased Value Container
// =============================================================================

/// A type-erased value produced by script evaluation
///
/// Toolchains wrap their native values here. A value that satisfies the host's
/// extension contract is stored as an [`Extension`](crate::extension::Extension),
/// which is what extraction checks for.
pub struct ScriptValue {
    inner: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl ScriptValue {
    /// Create a new ScriptValue from any type that is Send + 'static
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            inner: Box::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Whether the wrapped value is a `T`
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Rust type name of the wrapped value
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Attempt to downcast to a concrete type
    pub fn downcast<T: Any>(self) -> Result<T, ScriptError> {
        let found = self.type_name;
        self.inner
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| ScriptError::Runtime {
                message: format!(
                    "expected {}, found {}",
                    std::any::type_name::<T>(),
                    found
                ),
            })
    }

    /// Attempt to get a reference to the inner value
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptValue")
            .field("type", &self.type_name)
            .finish()
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Isolated execution context for one evaluation
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// Script label used in diagnostics and routed script output
    pub label: String,
}

impl EvaluationContext {
    /// Context for the script called `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

/// Everything a script's top-level code produced
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Value of the final expression, `None` when the script ends in a statement
    pub returned: Option<ScriptValue>,
    /// Top-level bindings in declaration order
    pub declarations: Vec<(String, ScriptValue)>,
}

// =============================================================================
// ScriptToolchain Trait
// =============================================================================

/// Compile/evaluate capability supplied to the host
///
/// # Thread Safety
///
/// Implementations must be Send + Sync so the compiler service can be shared
/// between load jobs. They do not need to be reentrant: the host never calls
/// into one toolchain from two threads at once.
pub trait ScriptToolchain: Send + Sync {
    /// Stable identifier, part of the cache header
    ///
    /// Changing it invalidates every cache entry the toolchain produced.
    fn id(&self) -> &str;

    /// Compile `source` against the resolved `classpath`
    ///
    /// The classpath lists library files in the order the script declared them.
    /// A reference the classpath cannot satisfy is a compilation error.
    fn compile(
        &self,
        source: &ScriptSource,
        classpath: &[PathBuf],
    ) -> Result<CompiledArtifact, ScriptError>;

    /// Run the top-level code of a compiled artifact
    ///
    /// Every call gets fresh interpreter state; nothing a script defines is
    /// visible to the next one.
    fn evaluate(
        &self,
        artifact: &CompiledArtifact,
        context: &EvaluationContext,
    ) -> Result<Evaluation, ScriptError>;
}

// =============================================================================
// Unit Tests
// =============================================================================
