//! Error types for the core library

use core::fmt;
use alloc::boxed::Box;
use alloc::string::String;

/// The core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Version string could not be parsed
    Version(VersionParseError),
    /// Mod ID is not acceptable
    Id(IdError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Version(e) => write!(f, "Version error: {}", e),
            Error::Id(e) => write!(f, "ID error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;

/// A version string that is not `vMAJOR.MINOR.PATCH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError {
    /// The rejected input
    pub input: Box<str>,
    /// What was wrong with it
    pub reason: &'static str,
}

impl VersionParseError {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.into(),
            reason,
        }
    }
}

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version '{}': {}", self.input, self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VersionParseError {}

impl From<VersionParseError> for Error {
    fn from(e: VersionParseError) -> Self {
        Error::Version(e)
    }
}

/// Mod ID errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// ID is empty
    Empty,
    /// ID contains a character outside printable ASCII
    InvalidCharacter { id: String, character: char },
    /// ID is a name the filesystem reserves
    Reserved(String),
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdError::Empty => write!(f, "mod ID is empty"),
            IdError::InvalidCharacter { id, character } => {
                write!(f, "mod ID '{}' contains invalid character {:?}", id, character)
            }
            IdError::Reserved(id) => write!(f, "mod ID '{}' is reserved", id),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for IdError {}

impl From<IdError> for Error {
    fn from(e: IdError) -> Self {
        Error::Id(e)
    }
}
