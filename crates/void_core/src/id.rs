//! Mod identifiers
//!
//! Mod IDs are recommended to look like `com.developer.mod`. They are
//! restricted to printable ASCII and compared without regard to case, so
//! `Com.Dev.Mod` and `com.dev.mod` name the same mod.

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use alloc::boxed::Box;
use alloc::string::String;

use crate::error::IdError;

/// Case-insensitive identifier of a mod
#[derive(Clone)]
pub struct ModId {
    name: Box<str>,
    hash: u64,
}

impl ModId {
    /// Create an ID without validating it
    ///
    /// Use [`ModId::parse`] for untrusted input such as manifests.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            hash: folded_hash(name),
        }
    }

    /// Create an ID, rejecting empty, non-ASCII, whitespace and control characters
    ///
    /// IDs name directories on disk, so path separators and the names `.`
    /// and `..` are rejected too.
    pub fn parse(name: &str) -> Result<Self, IdError> {
        if name.is_empty() {
            return Err(IdError::Empty);
        }
        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_graphic() || matches!(c, '/' | '\\' | ':'))
        {
            return Err(IdError::InvalidCharacter {
                id: name.into(),
                character: c,
            });
        }
        if name.chars().all(|c| c == '.') {
            return Err(IdError::Reserved(name.into()));
        }
        Ok(Self::new(name))
    }

    /// The ID as written in its manifest
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Get the precomputed case-folded hash
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Case-insensitive comparison against a plain string
    pub fn matches(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

// FNV-1a over the lowercased bytes
fn folded_hash(name: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in name.bytes() {
        hash ^= byte.to_ascii_lowercase() as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl PartialEq for ModId {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for ModId {}

impl Hash for ModId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for ModId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModId {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.name.bytes().map(|b| b.to_ascii_lowercase());
        let rhs = other.name.bytes().map(|b| b.to_ascii_lowercase());
        lhs.cmp(rhs)
    }
}

impl fmt::Debug for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModId({:?})", self.name)
    }
}

impl fmt::Display for ModId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for ModId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModId {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    #[test]
    fn test_case_insensitive_equality() {
        let a = ModId::new("com.void.Example");
        let b = ModId::new("COM.VOID.example");
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert!(a.matches("com.void.example"));
        assert_eq!(a.to_string(), "com.void.Example");
    }

    #[test]
    fn test_ordering_ignores_case() {
        let mut set = BTreeSet::new();
        set.insert(ModId::new("b.mod"));
        set.insert(ModId::new("A.mod"));
        set.insert(ModId::new("a.MOD"));
        let ordered: alloc::vec::Vec<_> = set.iter().map(|id| id.as_str()).collect();
        assert_eq!(ordered, ["A.mod", "b.mod"]);
    }

    #[test]
    fn test_parse_validation() {
        assert!(ModId::parse("com.void.ok-mod_1").is_ok());
        assert_eq!(ModId::parse(""), Err(IdError::Empty));
        assert!(matches!(
            ModId::parse("has space"),
            Err(IdError::InvalidCharacter { character: ' ', .. })
        ));
        assert!(ModId::parse("caf\u{e9}").is_err());
        assert!(ModId::parse("tab\there").is_err());
    }

    #[test]
    fn test_parse_rejects_paths() {
        assert!(matches!(
            ModId::parse("../../victim"),
            Err(IdError::InvalidCharacter { character: '/', .. })
        ));
        assert!(matches!(
            ModId::parse("..\\victim"),
            Err(IdError::InvalidCharacter { character: '\\', .. })
        ));
        assert!(ModId::parse("C:victim").is_err());
        assert_eq!(ModId::parse(".."), Err(IdError::Reserved("..".into())));
        assert_eq!(ModId::parse("."), Err(IdError::Reserved(".".into())));
        assert!(ModId::parse("..mod").is_ok());
    }
}
