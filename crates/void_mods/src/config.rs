//! Loader configuration
//!
//! Controls where the loader looks for mods and how strictly dependency
//! versions are enforced.
//!
//! # Configuration Sources (in priority order)
//!
//! 1. Environment variable: `VOID_MODS_DIR=/opt/game/void`
//! 2. Config file passed to [`LoaderConfig::load`]
//! 3. Built-in defaults
//!
//! # Example Config File
//!
//! ```toml
//! base_dir = "void"
//! mods_dir = "mods"          # relative to base_dir
//! staging_dir = "temp"       # purged at setup and shutdown
//! package_extension = "vmod"
//! version_policy = "soft"    # soft, strict
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`LoaderConfig::base_dir`]
pub const BASE_DIR_ENV: &str = "VOID_MODS_DIR";

/// Oldest manifest schema this build reads
pub const SCHEMA_MIN: i64 = 1;

/// Newest manifest schema this build reads
pub const SCHEMA_MAX: i64 = 1;

/// How a dependency whose version is below the requested minimum is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Flag the mismatch and carry on
    #[default]
    Soft,
    /// Treat the dependency as unresolved
    Strict,
}

impl std::fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl std::str::FromStr for VersionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "soft" | "" => Ok(Self::Soft),
            "strict" | "hard" => Ok(Self::Strict),
            _ => Err(format!("Unknown version policy: {}", s)),
        }
    }
}

/// Directory layout and policies of a [`ModRegistry`](crate::ModRegistry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Root of everything the loader owns
    pub base_dir: PathBuf,
    /// Resources shared by mods, relative to `base_dir`
    pub resources_dir: PathBuf,
    /// Scanned for packages, relative to `base_dir`
    pub mods_dir: PathBuf,
    /// Extracted binaries, relative to `base_dir`
    pub staging_dir: PathBuf,
    /// File extension of mod packages, without the dot
    pub package_extension: String,
    pub version_policy: VersionPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("void"),
            resources_dir: PathBuf::from("resources"),
            mods_dir: PathBuf::from("mods"),
            staging_dir: PathBuf::from("temp"),
            package_extension: "vmod".to_string(),
            version_policy: VersionPolicy::Soft,
        }
    }
}

impl LoaderConfig {
    /// Default layout rooted at `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document, missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        log::info!("Loaded loader config from {}", path.display());
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(BASE_DIR_ENV) {
            if !dir.is_empty() {
                self.base_dir = PathBuf::from(dir);
                log::info!("Mod base directory from env: {}", self.base_dir.display());
            }
        }
    }

    pub fn resources_path(&self) -> PathBuf {
        self.base_dir.join(&self.resources_dir)
    }

    pub fn mods_path(&self) -> PathBuf {
        self.base_dir.join(&self.mods_dir)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.base_dir.join(&self.staging_dir)
    }

    /// Whether `path` has the configured package extension
    pub fn is_package(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.package_extension))
            .unwrap_or(false)
    }

    /// Create the base, resources, mods and staging directories
    pub fn create_directories(&self) -> std::io::Result<()> {
        for dir in [self.resources_path(), self.mods_path(), self.staging_path()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Delete everything inside the staging directory
    pub fn purge_staging(&self) -> std::io::Result<()> {
        let staging = self.staging_path();
        if !staging.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&staging)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        log::debug!("Purged staging directory {}", staging.display());
        Ok(())
    }
}
