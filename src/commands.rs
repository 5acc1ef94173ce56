//! Management command surface.
//!
//! Command lines such as `enable 3` or `load echo.rhai` are parsed with clap and
//! executed against an [`ExtensionManager`]. Every outcome, including errors, is
//! rendered as plain text; nothing here panics or propagates an error.

use std::fmt::Write as _;
use std::path::{Component, Path};

use clap::{Parser, Subcommand};

use crate::error::HostError;
use crate::instance::ExtensionId;
use crate::manager::ExtensionManager;

/// One parsed management command.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(name = "ext", no_binary_name = true, disable_version_flag = true)]
pub struct ManagementCommand {
    /// Action to run
    #[command(subcommand)]
    pub action: Action,
}

/// Available actions.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Action {
    /// Summarise the cache and list loaded extensions.
    List,
    /// Show details and cache provenance of one extension.
    Info {
        /// Extension id
        id: ExtensionId,
    },
    /// Load a file from the plugins directory.
    Load {
        /// File name inside the plugins directory
        filename: String,
    },
    /// Unload an extension.
    Unload {
        /// Extension id
        id: ExtensionId,
    },
    /// Enable an extension.
    Enable {
        /// Extension id
        id: ExtensionId,
    },
    /// Disable an extension.
    Disable {
        /// Extension id
        id: ExtensionId,
    },
}

/// Parse a command line. On failure the error carries clap's usage text.
pub fn parse(line: &str) -> Result<ManagementCommand, String> {
    ManagementCommand::try_parse_from(line.split_whitespace())
        .map_err(|e| e.render().to_string().trim_end().to_string())
}

/// Parse and execute `line`.
pub fn run_line(manager: &ExtensionManager, line: &str) -> String {
    match parse(line) {
        Ok(command) => execute(manager, &command.action),
        Err(usage) => usage,
    }
}

/// Execute one action and render its outcome.
pub fn execute(manager: &ExtensionManager, action: &Action) -> String {
    match action {
        Action::List => list(manager),
        Action::Info { id } => info(manager, *id),
        Action::Load { filename } => load(manager, filename),
        Action::Unload { id } => match manager.unload_one(*id) {
            Ok(()) => format!("Extension {} unloaded.", id),
            Err(e) => e.user_message(),
        },
        Action::Enable { id } => match manager.enable_one(*id) {
            Ok(true) => format!("Extension {} enabled.", id),
            Ok(false) => format!("Extension {} is already enabled.", id),
            Err(e) => e.user_message(),
        },
        Action::Disable { id } => match manager.disable_one(*id) {
            Ok(true) => format!("Extension {} disabled.", id),
            Ok(false) => format!("Extension {} is not enabled.", id),
            Err(e) => e.user_message(),
        },
    }
}

fn list(manager: &ExtensionManager) -> String {
    let mut out = String::new();
    match manager.cache_stats() {
        Ok(stats) => {
            let _ = writeln!(
                out,
                "Cache: {} files, {} KB",
                stats.files,
                stats.bytes.div_ceil(1024)
            );
        }
        Err(e) => {
            let _ = writeln!(out, "Cache: unavailable ({})", e);
        }
    }

    let instances = manager.instances();
    let pending = manager.pending_files();
    let _ = write!(out, "Extensions: {} loaded", instances.len());
    if !pending.is_empty() {
        let _ = write!(out, ", {} loading", pending.len());
    }
    for instance in &instances {
        let desc = instance.descriptor();
        let _ = write!(
            out,
            "\n  {:>3}  {} {} by {} [{}] {}",
            instance.id(),
            desc.name,
            desc.version,
            desc.author,
            instance.state(),
            instance.file_name()
        );
    }
    out
}

fn info(manager: &ExtensionManager, id: ExtensionId) -> String {
    let Some(instance) = manager.get(id) else {
        return HostError::UnknownExtension(id).user_message();
    };
    let desc = instance.descriptor();
    let meta = instance.provenance();
    [
        format!("Id: {}", instance.id()),
        format!("Name: {}", desc.name),
        format!("Version: {}", desc.version),
        format!("Author: {}", desc.author),
        format!("Website: {}", desc.website),
        format!("State: {}", instance.state()),
        format!("File: {}", instance.file().display()),
        format!("Data directory: {}", instance.data_dir().display()),
        format!(
            "Loaded at: {} ({} ms)",
            instance.loaded_at().format("%Y-%m-%d %H:%M:%S UTC"),
            instance.load_duration().as_millis()
        ),
        format!(
            "Loaded via: {}",
            if meta.fresh_compile { "compile" } else { "cache" }
        ),
        format!("Cache header: {}", meta.header),
        format!("Cache origin: {}", meta.origin.display()),
        format!("Cache checksum: {}", meta.checksum),
        format!("Cache file: {}", meta.file.display()),
    ]
    .join("\n")
}

fn load(manager: &ExtensionManager, filename: &str) -> String {
    if !is_plain_file_name(filename) {
        return format!(
            "File \"{}\" must be a file name inside the plugins directory.",
            filename
        );
    }
    let path = manager.paths().plugins_dir().join(filename);
    match manager.submit(&path) {
        Ok(_) => format!("Loading {}.", filename),
        Err(HostError::UnsupportedFile(_)) => {
            format!("File \"{}\" is not a loadable extension.", filename)
        }
        Err(HostError::AlreadyLoaded(_)) => {
            format!("File \"{}\" is already loaded.", filename)
        }
        Err(e) => e.user_message(),
    }
}

/// A single normal path component, so the file stays inside the plugins directory.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
