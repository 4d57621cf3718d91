//! # void_mods - Mod Loader Runtime
//!
//! Discovers, validates, loads and manages third-party mods inside the host
//! process. Mods declare dependencies on each other, install code hooks and
//! patch bytes in memory; the loader keeps all of it consistent as mods come
//! and go.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │  ModPackage     │────▶│ manifest::      │
//! │  (zip / dir)    │     │ validate        │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ ModDescriptor
//!                                  ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ resolve::       │◀───▶│  ModRegistry    │
//! │ refresh_all     │     │ (pending/active)│
//! └─────────────────┘     └────────┬────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │BinaryProvisioner│────▶│  ModInterface   │
//! │ (libloading)    │     │  + ModContext   │
//! └─────────────────┘     └────────┬────────┘
//!                                  │
//!                    ┌─────────────┴─────────────┐
//!                    ▼                           ▼
//!           ┌─────────────────┐         ┌─────────────────┐
//!           │  HookManager    │         │  PatchManager   │
//!           │  (retour)       │         │ (/proc/self/mem)│
//!           └─────────────────┘         └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use void_mods::{LoaderConfig, ModRegistry};
//!
//! let mut config = LoaderConfig::default();
//! config.apply_env();
//!
//! let mut registry = ModRegistry::native(config);
//! let activated = registry.setup()?;
//! log::info!("{} mods loaded", activated);
//!
//! for entry in registry.journal().entries() {
//!     println!("{}", entry);
//! }
//! ```
//!
//! ## Mod Side
//!
//! A native mod exports `void_mod_load`, returning an [`ffi::FfiModInstance`],
//! or the C-style `void_mod_c_load` / `void_mod_c_unload` /
//! `void_mod_c_enable` / `void_mod_c_disable` functions. Mods linked into the
//! host implement [`ModInterface`] and are registered with a
//! [`FactoryProvisioner`].

mod config;
mod context;
mod error;
mod hook;
mod journal;
mod manifest;
mod package;
mod patch;
mod provision;
mod registry;
mod resolve;

pub mod ffi;

pub use config::{LoaderConfig, VersionPolicy, BASE_DIR_ENV, SCHEMA_MAX, SCHEMA_MIN};
pub use context::{ModContext, ModInterface};
pub use error::{ConfigError, HookError, LoadError, PatchError, Result, ValidationError};
pub use hook::{default_backend, Hook, HookBackend, HookId, HookManager, HookToken, UnsupportedBackend};
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use hook::DetourBackend;
pub use journal::{EntryId, Journal, LogEntry, Severity};
pub use manifest::{validate, validate_for, DependencyRequirement, ModDescriptor, Platform, DEFAULT_SCHEMA};
pub use package::{ModPackage, MANIFEST_FILE};
pub use patch::{MemoryAccess, Patch, PatchId, PatchManager, ProcessMemory};
pub use provision::{BinaryProvisioner, FactoryProvisioner, ModFactory, NativeProvisioner, PlatformHandle, Provisioned};
pub use registry::{ActiveMod, DisableCause, DiscoverOutcome, ModRegistry, PendingMod};
pub use resolve::{classify, refresh_all, ResolveEntry, ResolveReport, ResolveState};

pub use void_core::{ModId, VersionInfo};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LoaderConfig, VersionPolicy};
    pub use crate::context::{ModContext, ModInterface};
    pub use crate::error::{LoadError, Result};
    pub use crate::journal::Severity;
    pub use crate::manifest::ModDescriptor;
    pub use crate::provision::FactoryProvisioner;
    pub use crate::registry::{DiscoverOutcome, ModRegistry};
    pub use crate::resolve::ResolveState;
    pub use void_core::prelude::*;
}
