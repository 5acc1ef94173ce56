//! Core library for the plugin-host application.
//!
//! This library loads script extensions at runtime, compiles them into cached
//! artifacts, resolves their library dependencies and manages their lifecycle
//! (load, enable, disable, unload) inside a long-running host process. It is used
//! by the `plugin-host` binary and can be embedded in other hosts.

pub mod bundle;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod extension;
pub mod instance;
pub mod logging;
pub mod manager;
pub mod resolver;
pub mod scripting;

pub use error::{HostError, HostResult};
pub use extension::{Extension, ExtensionContext, ExtensionDescriptor};
pub use instance::{ExtensionId, ExtensionState};
pub use manager::{ExtensionManager, LoadTicket};
