//! Dependency resolution.
//!
//! Libraries live under `lib/<namespace>/`. A script lists the file names it needs
//! and the resolver turns them into a classpath. Missing files are reported, not
//! fatal: whatever was found is still handed to the compiler, which fails for that
//! one script if it really needed the missing library.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::extension::sanitize_dir_name;

/// A declared library that is not on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    /// Script that declared it
    pub source_label: String,
    /// Where it was expected
    pub expected_path: PathBuf,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: missing dependency {}",
            self.source_label,
            self.expected_path.display()
        )
    }
}

/// Result of resolving one script's libraries.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Found libraries in declaration order
    pub classpath: Vec<PathBuf>,
    /// Libraries that were declared but not found
    pub errors: Vec<MissingDependency>,
}

impl Resolution {
    /// Whether every declared library was found
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Locates declared libraries below a base library directory.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    lib_dir: PathBuf,
}

impl DependencyResolver {
    /// Resolver for libraries below `lib_dir`.
    pub fn new(lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            lib_dir: lib_dir.into(),
        }
    }

    /// Base library directory
    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// `lib/<namespace>/`; computed, never stored.
    pub fn library_root(&self, namespace: &str) -> PathBuf {
        self.lib_dir.join(sanitize_dir_name(namespace))
    }

    /// Resolve `libraries` inside `namespace`. Creates the library root if needed.
    pub fn resolve(&self, namespace: &str, libraries: &[String], source_label: &str) -> Resolution {
        let root = self.library_root(namespace);
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!(namespace, error = %e, "Cannot create library root {}", root.display());
        }

        let mut resolution = Resolution::default();
        for lib in libraries {
            let path = root.join(lib);
            if is_contained(lib) && path.is_file() {
                resolution.classpath.push(path);
            } else {
                resolution.errors.push(MissingDependency {
                    source_label: source_label.to_string(),
                    expected_path: path,
                });
            }
        }
        resolution
    }
}

/// Library names may name subdirectories but never leave the namespace root.
fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}
