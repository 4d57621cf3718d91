//! Semantic versioning for mod compatibility checks
//!
//! Versions render canonically as `vMAJOR.MINOR.PATCH`. Parsing accepts the
//! canonical form and the bare `MAJOR.MINOR.PATCH` form; everything else is
//! rejected rather than zero-filled.

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use crate::error::VersionParseError;

/// Semantic version of a mod or of a dependency requirement
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionInfo {
    /// Create a new version
    #[inline]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Version v0.0.0, the implicit minimum of a dependency
    pub const ZERO: VersionInfo = VersionInfo::new(0, 0, 0);

    /// Parse from `vMAJOR.MINOR.PATCH` (the leading `v` is optional)
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        let body = s.strip_prefix('v').unwrap_or(s);
        let mut parts = body.split('.');

        let major = parse_component(s, parts.next())?;
        let minor = parse_component(s, parts.next())?;
        let patch = parse_component(s, parts.next())?;

        if parts.next().is_some() {
            return Err(VersionParseError::new(s, "too many components"));
        }

        Ok(Self { major, minor, patch })
    }

    /// Check whether this version satisfies a minimum requirement
    #[inline]
    pub fn satisfies(&self, minimum: &VersionInfo) -> bool {
        self >= minimum
    }
}

fn parse_component(source: &str, part: Option<&str>) -> Result<u32, VersionParseError> {
    let part = part.ok_or_else(|| VersionParseError::new(source, "expected three components"))?;
    if part.is_empty() {
        return Err(VersionParseError::new(source, "empty component"));
    }
    // `u32::from_str` accepts a leading '+', which is not a version digit
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VersionParseError::new(source, "components must be decimal digits"));
    }
    part.parse()
        .map_err(|_| VersionParseError::new(source, "component out of range"))
}

impl PartialOrd for VersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl FromStr for VersionInfo {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl fmt::Debug for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionInfo({})", self)
    }
}

/// Macro for creating versions at compile time
#[macro_export]
macro_rules! version {
    ($major:expr, $minor:expr, $patch:expr) => {
        $crate::VersionInfo::new($major, $minor, $patch)
    };
    ($major:expr, $minor:expr) => {
        $crate::VersionInfo::new($major, $minor, 0)
    };
}
