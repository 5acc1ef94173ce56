//! Source directives.
//!
//! Scripts declare their dependency context in line comments, which the toolchain
//! itself ignores:
//!
//! ```text
//! //@namespace tools
//! //@lib greeting.rhai, strings.rhai
//! //@lib clock.rhai
//! ```
//!
//! The last `//@namespace` wins. `//@lib` lines accumulate in order; repeated names
//! are kept once.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Namespace used when a script declares none.
pub const DEFAULT_NAMESPACE: &str = "public";

static DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^\s*//@(namespace|lib)\s+(.+?)\s*$").expect("directive pattern")
});

/// Dependency context declared by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptMetadata {
    /// Library namespace
    pub namespace: String,
    /// Required library file names in declaration order
    pub libraries: Vec<String>,
}

impl Default for ScriptMetadata {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            libraries: Vec::new(),
        }
    }
}

impl ScriptMetadata {
    /// Scan `text` for directives.
    pub fn parse(text: &str) -> Self {
        let mut metadata = Self::default();
        for line in text.lines() {
            let Some(caps) = DIRECTIVE.captures(line) else {
                continue;
            };
            let value = &caps[2];
            match &caps[1] {
                "namespace" => metadata.namespace = value.to_string(),
                _ => {
                    for lib in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        if !metadata.libraries.iter().any(|l| l == lib) {
                            metadata.libraries.push(lib.to_string());
                        }
                    }
                }
            }
        }
        metadata
    }
}

/// A script as read from disk. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ScriptSource {
    text: String,
    origin: PathBuf,
    metadata: ScriptMetadata,
}

impl ScriptSource {
    /// Wrap source text read from `origin`, parsing its directives.
    pub fn new(origin: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        let text = text.into();
        let metadata = ScriptMetadata::parse(&text);
        Self {
            text,
            origin: origin.into(),
            metadata,
        }
    }

    /// Read a script file.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(path, text))
    }

    /// Source text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// File the text came from (for bundles, the archive)
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// File name used in diagnostics
    pub fn label(&self) -> String {
        self.origin
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.origin.display().to_string())
    }

    /// Declared namespace
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Declared libraries
    pub fn libraries(&self) -> &[String] {
        &self.metadata.libraries
    }

    /// All declared metadata
    pub fn metadata(&self) -> &ScriptMetadata {
        &self.metadata
    }
}
