//! Script compilation and evaluation.
//!
//! The host treats the scripting language as a pluggable toolchain behind the
//! [`ScriptToolchain`] trait and drives it through one shared [`ScriptCompiler`].
//!
//! # Architecture
//!
//! ```text
//! ScriptSource (directives pre-parsed)
//!     │
//!     ▼
//! ScriptCompiler ── lazy init, single guard
//!     └── ScriptToolchain trait
//!             └── RhaiToolchain (default)
//!     │
//!     ▼
//! CompiledArtifact ──► Evaluation ──► ExtractionOutcome + Extension
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use plugin_host::scripting::{ScriptCompiler, ScriptSource};
//!
//! let compiler = ScriptCompiler::rhai(1_000_000);
//! let source = ScriptSource::read(Path::new("plugins/echo.rhai"))?;
//! let artifact = compiler.compile(&source, &[])?;
//! let extracted = ScriptCompiler::extract(compiler.evaluate(&artifact, "echo.rhai")?)?;
//! println!("{}", extracted.extension.descriptor().name);
//! ```

pub mod compiler;
pub mod directives;
pub mod rhai_engine;
pub mod script_engine;

pub use compiler::{ExtractionOutcome, Extracted, ScriptCompiler, HEADER_PREFIX};
pub use directives::{ScriptMetadata, ScriptSource, DEFAULT_NAMESPACE};
pub use rhai_engine::{RhaiToolchain, RHAI_TOOLCHAIN_ID};
pub use script_engine::{
    CompiledArtifact, Evaluation, EvaluationContext, ScriptError, ScriptToolchain, ScriptValue,
};
