//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use plugin_host::config::{HostConfig, PathsConfig};
use plugin_host::extension::Extension;
use plugin_host::scripting::{
    CompiledArtifact, Evaluation, EvaluationContext, ScriptError, ScriptSource, ScriptToolchain,
    ScriptValue,
};

/// Host layout below `root` with a fixed worker count.
pub fn config(root: &Path, workers: usize) -> HostConfig {
    let mut config = HostConfig::default();
    config.paths = PathsConfig::rooted_at(root);
    config.loader.workers = Some(workers);
    config.loader.max_operations = 100_000;
    config
}

/// Write `text` to `plugins/<name>`.
pub fn write_plugin(config: &HostConfig, name: &str, text: &str) -> PathBuf {
    let dir = config.paths.plugins_dir();
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    path
}

/// Build a zip at `path` from (name, content) pairs; `None` content adds a directory.
pub fn write_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        match content {
            Some(text) => {
                zip.start_file(*name, options).unwrap();
                zip.write_all(text.as_bytes()).unwrap();
            }
            None => zip.add_directory(*name, options).unwrap(),
        }
    }
    zip.finish().unwrap();
}

// =============================================================================
// Mock toolchain
// =============================================================================

/// Blocks compiles of scripts containing `wait` until opened.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

/// Hook invocation counters shared by every extension a mock produces.
#[derive(Default)]
pub struct HookCounts {
    pub load: AtomicUsize,
    pub enable: AtomicUsize,
    pub disable: AtomicUsize,
    pub unload: AtomicUsize,
}

/// Toolchain whose scripts are one line `name <Name>`.
///
/// Script text containing `syntax error` fails to compile, `throw` fails at
/// evaluation and `wait` blocks compilation on the gate.
pub struct MockToolchain {
    pub compiles: AtomicUsize,
    pub evaluations: AtomicUsize,
    pub hooks: Arc<HookCounts>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    delay: Duration,
    gate: Gate,
}

impl MockToolchain {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::with_gate(delay, Gate::default()).0
    }

    pub fn gated() -> (Arc<Self>, Gate) {
        Self::with_gate(Duration::ZERO, Gate::default())
    }

    fn with_gate(delay: Duration, gate: Gate) -> (Arc<Self>, Gate) {
        let toolchain = Arc::new(Self {
            compiles: AtomicUsize::new(0),
            evaluations: AtomicUsize::new(0),
            hooks: Arc::new(HookCounts::default()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay,
            gate: gate.clone(),
        });
        (toolchain, gate)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn extension(&self, text: &str) -> Extension {
        let name = text
            .lines()
            .find_map(|l| l.strip_prefix("name "))
            .unwrap_or("Unnamed")
            .trim()
            .to_string();
        let (h1, h2, h3, h4) = (
            self.hooks.clone(),
            self.hooks.clone(),
            self.hooks.clone(),
            self.hooks.clone(),
        );
        Extension::builder(name)
            .version("1.0")
            .on_load(move |_| {
                h1.load.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_enable(move |_| {
                h2.enable.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_disable(move |_| {
                h3.disable.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_unload(move |_| {
                h4.unload.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
    }
}

impl ScriptToolchain for MockToolchain {
    fn id(&self) -> &str {
        "mock"
    }

    fn compile(
        &self,
        source: &ScriptSource,
        _classpath: &[PathBuf],
    ) -> Result<CompiledArtifact, ScriptError> {
        if source.text().contains("wait") {
            self.gate.wait();
        }
        self.enter();
        std::thread::sleep(self.delay);
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.leave();

        if source.text().contains("syntax error") {
            return Err(ScriptError::Compilation {
                message: "syntax error".to_string(),
                line: Some(1),
                column: None,
            });
        }
        Ok(CompiledArtifact {
            toolchain: "mock".to_string(),
            payload: source.text().as_bytes().to_vec(),
        })
    }

    fn evaluate(
        &self,
        artifact: &CompiledArtifact,
        _context: &EvaluationContext,
    ) -> Result<Evaluation, ScriptError> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8_lossy(&artifact.payload);
        if text.contains("throw") {
            return Err(ScriptError::Runtime {
                message: "thrown".to_string(),
            });
        }
        Ok(Evaluation {
            returned: Some(ScriptValue::new(self.extension(&text))),
            declarations: Vec::new(),
        })
    }
}
