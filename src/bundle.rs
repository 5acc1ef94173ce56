//! Bundle archives (`*.rhai.zip`).
//!
//! A bundle packs one extension script with the libraries it needs:
//!
//! ```text
//! echo.rhai.zip
//! ├── echo.rhai          exactly one script at the archive root
//! └── libs/              at most one directory
//!     ├── greeting.rhai
//!     └── strings.rhai
//! ```
//!
//! Everything below the directory is copied into the script's library root
//! (`lib/<namespace>/`), keeping sub-paths. Files that already exist there are
//! left alone. Other root-level files are ignored.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{HostError, HostResult};
use crate::scripting::ScriptSource;

/// Suffix identifying bundle archives.
pub const BUNDLE_SUFFIX: &str = ".rhai.zip";

/// A validated bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    archive: PathBuf,
    script_name: String,
    script: String,
    library_dir: Option<String>,
    libraries: Vec<(usize, PathBuf)>,
}

impl Bundle {
    /// Open and validate the archive at `path`.
    ///
    /// # Errors
    ///
    /// `MalformedBundle` unless the archive holds exactly one root-level script and
    /// at most one top-level directory, or if an entry path escapes the archive.
    pub fn open(path: &Path) -> HostResult<Self> {
        let malformed = |reason: String| HostError::MalformedBundle {
            path: path.to_path_buf(),
            reason,
        };

        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut scripts = Vec::new();
        let mut dirs = BTreeSet::new();
        let mut nested = Vec::new();

        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            let Some(name) = entry.enclosed_name() else {
                return Err(malformed(format!("unsafe entry path '{}'", entry.name())));
            };
            let parts: Vec<String> = name
                .components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            let Some(top) = parts.first() else {
                continue;
            };

            if entry.is_dir() || parts.len() > 1 {
                dirs.insert(top.clone());
            }
            if entry.is_dir() {
                continue;
            }
            if parts.len() == 1 {
                if top.ends_with(".rhai") {
                    scripts.push((index, top.clone()));
                }
            } else {
                nested.push((index, parts[1..].iter().collect::<PathBuf>()));
            }
        }

        if dirs.len() > 1 {
            return Err(malformed(format!(
                "multiple directories ({})",
                dirs.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
        let (script_index, script_name) = match scripts.len() {
            0 => return Err(malformed("no script at the archive root".to_string())),
            1 => scripts.remove(0),
            n => return Err(malformed(format!("{} scripts at the archive root", n))),
        };

        let mut script = String::new();
        archive
            .by_index(script_index)?
            .read_to_string(&mut script)
            .map_err(|e| malformed(format!("{}: {}", script_name, e)))?;

        debug!(
            bundle = %path.display(),
            script = %script_name,
            libraries = nested.len(),
            "Bundle validated"
        );

        Ok(Self {
            archive: path.to_path_buf(),
            script_name,
            script,
            library_dir: dirs.into_iter().next(),
            libraries: nested,
        })
    }

    /// Name of the embedded script
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Embedded script text
    pub fn script(&self) -> &str {
        &self.script
    }

    /// The bundled library directory, if any
    pub fn library_dir(&self) -> Option<&str> {
        self.library_dir.as_deref()
    }

    /// Script as a source whose origin is the archive.
    pub fn source(&self) -> ScriptSource {
        ScriptSource::new(&self.archive, self.script.clone())
    }

    /// Copy bundled libraries below `root`, skipping files that already exist.
    ///
    /// Returns the files written.
    pub fn extract_libraries(&self, root: &Path) -> HostResult<Vec<PathBuf>> {
        if self.libraries.is_empty() {
            return Ok(Vec::new());
        }

        let mut archive = ZipArchive::new(File::open(&self.archive)?)?;
        let mut written = Vec::new();
        for (index, relative) in &self.libraries {
            let target = root.join(relative);
            if target.exists() {
                debug!(library = %target.display(), "Library already present");
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut entry = archive.by_index(*index)?;
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            written.push(target);
        }

        if !written.is_empty() {
            info!(
                bundle = %self.archive.display(),
                count = written.len(),
                "Extracted bundled libraries into {}",
                root.display()
            );
        }
        Ok(written)
    }
}

/// Whether `path` names a bundle archive.
pub fn is_bundle(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(BUNDLE_SUFFIX))
}
