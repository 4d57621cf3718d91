//! Error types for the mod runtime

use std::path::PathBuf;
use thiserror::Error;
use void_core::{IdError, ModId, VersionParseError};

use crate::hook::HookId;
use crate::patch::PatchId;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// A manifest that does not describe a usable mod
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The manifest root is not a JSON object
    #[error("manifest root is not a JSON object")]
    NotAnObject,

    /// A required field is absent
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but has the wrong JSON type
    #[error("field '{field}' must be {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },

    /// The manifest targets a schema this build cannot read
    #[error("manifest schema {found} is outside the supported range {min}..={max}")]
    SchemaOutOfRange { found: i64, min: i64, max: i64 },

    /// A version string does not parse
    #[error("field '{field}': {source}")]
    InvalidVersion {
        field: &'static str,
        source: VersionParseError,
    },

    /// The binary name is not a plain file name inside the package
    #[error("field '{field}': '{name}' is not a file name inside the package")]
    InvalidBinaryName { field: &'static str, name: String },

    /// The mod ID is not acceptable
    #[error("invalid mod ID: {0}")]
    InvalidId(#[from] IdError),
}

impl ValidationError {
    /// The manifest was written for an older loader than this one supports
    pub fn is_too_old(&self) -> bool {
        matches!(self, ValidationError::SchemaOutOfRange { found, min, .. } if found < min)
    }

    /// The manifest was written for a newer loader than this one
    pub fn is_too_new(&self) -> bool {
        matches!(self, ValidationError::SchemaOutOfRange { found, max, .. } if found > max)
    }
}

/// Errors raised while discovering, activating or unloading mods
#[derive(Debug, Error)]
pub enum LoadError {
    /// The package has no manifest at its top level
    #[error("'{}' is missing {}", .path.display(), crate::package::MANIFEST_FILE)]
    ManifestMissing { path: PathBuf },

    /// The package or its manifest could not be read or decoded
    #[error("'{}': unable to read manifest: {reason}", .path.display())]
    ManifestUnreadable { path: PathBuf, reason: String },

    /// The manifest failed validation
    #[error("'{}': {source}", .path.display())]
    Validation {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },

    /// The platform loader refused the mod binary
    #[error("unable to load binary of '{id}' from '{}': {reason}", .path.display())]
    BinaryLoadFailed {
        id: ModId,
        path: PathBuf,
        reason: String,
    },

    /// The binary exports none of the known entry points
    #[error("'{}' of mod '{id}' exports no known entry point", .path.display())]
    EntryPointMissing { id: ModId, path: PathBuf },

    /// Another pending or active mod already uses this ID
    #[error("a mod with ID '{0}' is already known")]
    DuplicateId(ModId),

    /// Required dependencies form a cycle
    #[error("dependency cycle: {}", join_ids(.0))]
    DependencyCycle(Vec<ModId>),

    /// The mod cannot run until these required dependencies are loaded
    #[error("'{id}' has unresolved required dependencies: {}", join_ids(.missing))]
    UnresolvedDependencies { id: ModId, missing: Vec<ModId> },

    /// No pending mod has this ID
    #[error("'{0}' is not a pending mod")]
    NotPending(ModId),

    /// No active mod has this ID
    #[error("'{0}' is not loaded")]
    NotActive(ModId),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Create a binary load error
    pub fn binary_load_failed(
        id: &ModId,
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        LoadError::BinaryLoadFailed {
            id: id.clone(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a manifest read error
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        LoadError::ManifestUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

fn join_ids(ids: &[ModId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Hook installation and toggling errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// Another mod already intercepts this address
    #[error("address {address:#x} is already hooked by '{owner}'")]
    AddressConflict { address: usize, owner: ModId },

    /// The platform backend could not create the detour
    #[error("unable to install hook at {address:#x}: {reason}")]
    InstallFailed { address: usize, reason: String },

    /// The platform backend could not enable or disable the detour
    #[error("unable to toggle hook at {address:#x}: {reason}")]
    ToggleFailed { address: usize, reason: String },

    /// Unknown or already removed hook
    #[error("hook {0} not found")]
    NotFound(HookId),

    /// The hook belongs to another mod
    #[error("hook {hook} is not owned by '{caller}'")]
    NotOwner { hook: HookId, caller: ModId },

    /// No detour backend exists for this platform
    #[error("code hooks are not supported on this platform")]
    Unsupported,
}

/// Byte patch errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// The original bytes could not be read; nothing was written
    #[error("unable to read {len} bytes at {address:#x}: {reason}")]
    ReadFailed {
        address: usize,
        len: usize,
        reason: String,
    },

    /// The bytes could not be written
    #[error("unable to write {len} bytes at {address:#x}: {reason}")]
    WriteFailed {
        address: usize,
        len: usize,
        reason: String,
    },

    /// Zero-length patches are meaningless
    #[error("empty patch at {address:#x}")]
    Empty { address: usize },

    /// The range intersects a live patch
    #[error("patch of {len} bytes at {address:#x} overlaps patch {existing}")]
    Overlap {
        address: usize,
        len: usize,
        existing: PatchId,
    },

    /// Replacement and expected original differ in length
    #[error("replacement is {found} bytes but the expected original is {expected} bytes")]
    LengthMismatch { expected: usize, found: usize },

    /// Memory does not hold the bytes the caller expected to replace
    #[error("memory at {address:#x} does not match the expected original bytes")]
    UnexpectedBytes { address: usize },

    /// Unknown or already restored patch
    #[error("patch {0} not found")]
    NotFound(PatchId),

    /// The patch belongs to another mod
    #[error("patch {patch} is not owned by '{caller}'")]
    NotOwner { patch: PatchId, caller: ModId },
}

/// Loader configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
