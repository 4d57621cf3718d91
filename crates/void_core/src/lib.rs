//! # void_core - Void Engine Core
//!
//! Zero-dependency primitives shared by the mod runtime:
//! - [`VersionInfo`]: semantic versions rendered as `vMAJOR.MINOR.PATCH`
//! - [`ModId`]: case-insensitive ASCII mod identifiers
//!
//! Everything here is plain data with no I/O, so it can be used by hosts,
//! tooling and mods alike.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std as alloc;

pub mod error;
pub mod id;
pub mod version;

pub use error::*;
pub use id::*;
pub use version::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, IdError, Result, VersionParseError};
    pub use crate::id::ModId;
    pub use crate::version::VersionInfo;
}
