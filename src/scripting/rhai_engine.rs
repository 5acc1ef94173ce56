//! Rhai Implementation of ScriptToolchain
//!
//! The default toolchain. Scripts are written in Rhai and build their extension
//! through a small registered API:
//!
//! ```text
//! //@namespace tools
//! //@lib greeting.rhai
//! import "greeting" as greeting;
//!
//! let banner = greeting::banner();
//!
//! extension("Echo")
//!     .version("1.0")
//!     .on_enable(|ctx| {
//!         ctx.info(banner + ctx.name);
//!         ctx.every(1000, |ctx| ctx.verbose("tick"));
//!     })
//! ```
//!
//! Imported modules are visible to top-level code. Hooks run later, so they
//! reach library values through captured variables.
//!
//! # Artifacts
//!
//! Rhai has no stable serialised AST, so compilation verifies and links the
//! script against its libraries and then stores the verified sources. The
//! artifact payload is a bincode-encoded [`RhaiArtifact`]. Evaluation re-links
//! it inside a brand new `Engine`, which keeps scripts isolated from each other.
//!
//! # Safety Limits
//!
//! Each run (compile-time library evaluation, top-level code, every hook call)
//! is bounded by an operation limit enforced through `on_progress`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rhai::module_resolvers::StaticModuleResolver;
use rhai::{
    Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Module, ParseError, Position,
    Scope, AST,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::directives::ScriptSource;
use super::script_engine::{
    CompiledArtifact, Evaluation, EvaluationContext, ScriptError, ScriptToolchain, ScriptValue,
};
use crate::extension::{Extension, ExtensionContext, ExtensionDescriptor};
use crate::logging::EXTENSION_TARGET;

/// Identifier written into artifacts and cache headers.
pub const RHAI_TOOLCHAIN_ID: &str = "rhai-1";

// =============================================================================
// Artifact payload
// =============================================================================

/// A library linked into an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedModule {
    /// Library file name as declared
    pub name: String,
    /// Library source text
    pub source: String,
}

/// Payload of a Rhai artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RhaiArtifact {
    /// Verified script text
    pub script: String,
    /// Libraries in link order
    pub modules: Vec<LinkedModule>,
}

// =============================================================================
// Script-facing API
// =============================================================================

/// Extension under construction inside a script.
#[derive(Debug, Clone)]
struct RhaiExtension {
    descriptor: ExtensionDescriptor,
    on_load: Option<FnPtr>,
    on_enable: Option<FnPtr>,
    on_disable: Option<FnPtr>,
    on_unload: Option<FnPtr>,
}

/// Evaluated script kept alive for hook calls.
struct RhaiRuntime {
    engine: Engine,
    ast: AST,
}

impl RhaiRuntime {
    fn call(self: &Arc<Self>, hook: &FnPtr, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let script_ctx = RhaiContext {
            inner: ctx.clone(),
            runtime: Arc::clone(self),
        };
        hook.call::<Dynamic>(&self.engine, &self.ast, (script_ctx,))
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("{} failed: {}", hook.fn_name(), e))
    }

    fn hook(
        self: &Arc<Self>,
        hook: FnPtr,
    ) -> impl Fn(&ExtensionContext) -> anyhow::Result<()> + Send + Sync + 'static {
        let runtime = Arc::clone(self);
        move |ctx| runtime.call(&hook, ctx)
    }

    fn into_extension(self: &Arc<Self>, ext: RhaiExtension) -> Extension {
        let desc = ext.descriptor;
        let mut builder = Extension::builder(desc.name)
            .version(desc.version)
            .author(desc.author)
            .website(desc.website);
        if let Some(f) = ext.on_load {
            builder = builder.on_load(self.hook(f));
        }
        if let Some(f) = ext.on_enable {
            builder = builder.on_enable(self.hook(f));
        }
        if let Some(f) = ext.on_disable {
            builder = builder.on_disable(self.hook(f));
        }
        if let Some(f) = ext.on_unload {
            builder = builder.on_unload(self.hook(f));
        }
        builder.build()
    }

    fn script_value(self: &Arc<Self>, value: Dynamic) -> ScriptValue {
        if value.is::<RhaiExtension>() {
            ScriptValue::new(self.into_extension(value.cast::<RhaiExtension>()))
        } else {
            ScriptValue::new(value)
        }
    }
}

/// `ctx` argument seen by hooks.
#[derive(Clone)]
struct RhaiContext {
    inner: ExtensionContext,
    runtime: Arc<RhaiRuntime>,
}

impl RhaiContext {
    fn every(&mut self, period_ms: i64, task: FnPtr) -> Result<(), Box<EvalAltResult>> {
        if period_ms <= 0 {
            return Err(format!("every: period must be positive, got {}", period_ms).into());
        }
        let period = Duration::from_millis(period_ms.unsigned_abs());
        let runtime = Arc::clone(&self.runtime);
        let ctx = self.inner.clone();
        self.inner.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let runtime = Arc::clone(&runtime);
                let task = task.clone();
                let call_ctx = ctx.clone();
                match tokio::task::spawn_blocking(move || runtime.call(&task, &call_ctx)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => ctx.logger().warn(&format!("Periodic task error: {}", e)),
                    Err(_) => break,
                }
            }
        });
        Ok(())
    }
}

fn register_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<RhaiExtension>("Extension")
        .register_fn("extension", |name: ImmutableString| RhaiExtension {
            descriptor: ExtensionDescriptor::new(name.as_str()),
            on_load: None,
            on_enable: None,
            on_disable: None,
            on_unload: None,
        })
        .register_fn("version", |ext: &mut RhaiExtension, v: ImmutableString| {
            ext.descriptor.version = v.to_string();
            ext.clone()
        })
        .register_fn("author", |ext: &mut RhaiExtension, v: ImmutableString| {
            ext.descriptor.author = v.to_string();
            ext.clone()
        })
        .register_fn("website", |ext: &mut RhaiExtension, v: ImmutableString| {
            ext.descriptor.website = v.to_string();
            ext.clone()
        })
        .register_fn("on_load", |ext: &mut RhaiExtension, f: FnPtr| {
            ext.on_load = Some(f);
            ext.clone()
        })
        .register_fn("on_enable", |ext: &mut RhaiExtension, f: FnPtr| {
            ext.on_enable = Some(f);
            ext.clone()
        })
        .register_fn("on_disable", |ext: &mut RhaiExtension, f: FnPtr| {
            ext.on_disable = Some(f);
            ext.clone()
        })
        .register_fn("on_unload", |ext: &mut RhaiExtension, f: FnPtr| {
            ext.on_unload = Some(f);
            ext.clone()
        })
        .register_get("name", |ext: &mut RhaiExtension| ext.descriptor.name.clone());

    engine
        .register_type_with_name::<RhaiContext>("Context")
        .register_get("id", |c: &mut RhaiContext| c.inner.id() as i64)
        .register_get("name", |c: &mut RhaiContext| c.inner.name().to_string())
        .register_get("data_dir", |c: &mut RhaiContext| {
            c.inner.data_dir().display().to_string()
        })
        .register_get("active", |c: &mut RhaiContext| c.inner.is_active())
        .register_fn("verbose", |c: &mut RhaiContext, msg: ImmutableString| {
            c.inner.logger().debug(&msg)
        })
        .register_fn("info", |c: &mut RhaiContext, msg: ImmutableString| {
            c.inner.logger().info(&msg)
        })
        .register_fn("warn", |c: &mut RhaiContext, msg: ImmutableString| {
            c.inner.logger().warn(&msg)
        })
        .register_fn("error", |c: &mut RhaiContext, msg: ImmutableString| {
            c.inner.logger().error(&msg)
        })
        .register_fn("every", RhaiContext::every);
}

// =============================================================================
// RhaiToolchain
// =============================================================================

/// Rhai-based implementation of ScriptToolchain
///
/// Holds no interpreter state between calls; every compile and evaluate builds
/// its own `Engine`.
#[derive(Debug, Clone)]
pub struct RhaiToolchain {
    max_operations: u64,
}

impl RhaiToolchain {
    /// Toolchain with the default limit of 1,000,000 operations per run
    pub fn new() -> Self {
        Self::with_limit(1_000_000)
    }

    /// Toolchain with a custom operation limit (0 = unlimited)
    pub fn with_limit(max_operations: u64) -> Self {
        Self { max_operations }
    }

    fn engine(&self, label: &str) -> Engine {
        let mut engine = Engine::new();

        let max_operations = self.max_operations;
        if max_operations > 0 {
            engine.on_progress(move |count| {
                if count > max_operations {
                    Some(
                        format!(
                            "Safety limit exceeded: maximum {} operations",
                            max_operations
                        )
                        .into(),
                    )
                } else {
                    None
                }
            });
        }

        let print_label = label.to_string();
        engine.on_print(move |s| {
            info!(target: EXTENSION_TARGET, script = %print_label, "{}", s);
        });
        let debug_label = label.to_string();
        engine.on_debug(move |s, _src, pos| {
            debug!(target: EXTENSION_TARGET, script = %debug_label, position = %pos, "{}", s);
        });

        register_api(&mut engine);
        engine
    }

    /// Evaluate each library as a module, in order, and register it under its
    /// file name and file stem. Later libraries may import earlier ones.
    fn link(
        &self,
        engine: &mut Engine,
        modules: &[LinkedModule],
    ) -> Result<StaticModuleResolver, ScriptError> {
        let mut resolver = StaticModuleResolver::new();
        for lib in modules {
            engine.set_module_resolver(resolver.clone());
            let ast = engine
                .compile(&lib.source)
                .map_err(|e| parse_error(&lib.name, e))?;
            let module = Module::eval_ast_as_new(Scope::new(), &ast, engine)
                .map_err(|e| compile_error(&lib.name, *e))?;

            resolver.insert(lib.name.as_str(), module.clone());
            if let Some(stem) = module_stem(&lib.name) {
                resolver.insert(stem, module);
            }
        }
        engine.set_module_resolver(resolver.clone());
        Ok(resolver)
    }
}

impl Default for RhaiToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptToolchain for RhaiToolchain {
    fn id(&self) -> &str {
        RHAI_TOOLCHAIN_ID
    }

    fn compile(
        &self,
        source: &ScriptSource,
        classpath: &[PathBuf],
    ) -> Result<CompiledArtifact, ScriptError> {
        let label = source.label();
        let mut modules = Vec::with_capacity(classpath.len());
        for path in classpath {
            let text = std::fs::read_to_string(path).map_err(|e| ScriptError::Backend {
                backend: "Rhai".to_string(),
                message: format!("cannot read library {}: {}", path.display(), e),
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            modules.push(LinkedModule { name, source: text });
        }

        let mut engine = self.engine(&label);
        self.link(&mut engine, &modules)?;
        engine
            .compile_into_self_contained(&Scope::new(), source.text())
            .map_err(|e| compile_error(&label, *e))?;

        let payload = bincode::serialize(&RhaiArtifact {
            script: source.text().to_string(),
            modules,
        })
        .map_err(|e| ScriptError::Artifact {
            message: e.to_string(),
        })?;

        Ok(CompiledArtifact {
            toolchain: RHAI_TOOLCHAIN_ID.to_string(),
            payload,
        })
    }

    fn evaluate(
        &self,
        artifact: &CompiledArtifact,
        context: &EvaluationContext,
    ) -> Result<Evaluation, ScriptError> {
        if artifact.toolchain != RHAI_TOOLCHAIN_ID {
            return Err(ScriptError::Artifact {
                message: format!(
                    "artifact was produced by '{}', not '{}'",
                    artifact.toolchain, RHAI_TOOLCHAIN_ID
                ),
            });
        }
        let decoded: RhaiArtifact =
            bincode::deserialize(&artifact.payload).map_err(|e| ScriptError::Artifact {
                message: e.to_string(),
            })?;

        let mut engine = self.engine(&context.label);
        self.link(&mut engine, &decoded.modules)?;
        let ast = engine
            .compile(&decoded.script)
            .map_err(|e| parse_error(&context.label, e))?;

        let runtime = Arc::new(RhaiRuntime { engine, ast });
        let mut scope = Scope::new();
        let returned: Dynamic = runtime
            .engine
            .eval_ast_with_scope(&mut scope, &runtime.ast)
            .map_err(|e| runtime_error(*e))?;

        let returned = if returned.is_unit() {
            None
        } else {
            Some(runtime.script_value(returned))
        };
        let declarations = scope
            .iter()
            .map(|(name, _constant, value)| (name.to_string(), runtime.script_value(value)))
            .collect();

        Ok(Evaluation {
            returned,
            declarations,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn module_stem(name: &str) -> Option<&str> {
    name.strip_suffix(".rhai").filter(|stem| !stem.is_empty())
}

fn location(pos: Position) -> (Option<usize>, Option<usize>) {
    (pos.line(), pos.position())
}

fn parse_error(label: &str, error: ParseError) -> ScriptError {
    let (line, column) = location(error.1);
    ScriptError::Compilation {
        message: format!("{}: {}", label, error.0),
        line,
        column,
    }
}

/// Convert an error raised while linking or compiling into a compilation error
fn compile_error(label: &str, error: EvalAltResult) -> ScriptError {
    match error {
        EvalAltResult::ErrorParsing(parse_error, pos) => {
            let (line, column) = location(pos);
            ScriptError::Compilation {
                message: format!("{}: {}", label, parse_error),
                line,
                column,
            }
        }
        EvalAltResult::ErrorModuleNotFound(module, pos) => {
            let (line, column) = location(pos);
            ScriptError::Compilation {
                message: format!("{}: unresolved import '{}'", label, module),
                line,
                column,
            }
        }
        EvalAltResult::ErrorTerminated(token, pos) => {
            let (line, column) = location(pos);
            ScriptError::Compilation {
                message: format!("{}: {}", label, token),
                line,
                column,
            }
        }
        other => {
            let (line, column) = location(other.position());
            ScriptError::Compilation {
                message: format!("{}: {}", label, other),
                line,
                column,
            }
        }
    }
}

/// Convert a top-level runtime failure
fn runtime_error(error: EvalAltResult) -> ScriptError {
    match error {
        EvalAltResult::ErrorRuntime(value, pos) => {
            warn!(position = %pos, "Script threw {}", value);
            ScriptError::Runtime {
                message: format!("{} ({})", value, pos),
            }
        }
        // Raised by the operation limit; the token carries the reason.
        EvalAltResult::ErrorTerminated(token, pos) => ScriptError::Runtime {
            message: format!("{} ({})", token, pos),
        },
        other => ScriptError::Runtime {
            message: other.to_string(),
        },
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
