//! User-visible loader journal
//!
//! Everything the loader wants a player or mod author to see (failed
//! manifests, missing dependencies, hook errors) is recorded here as well as
//! forwarded to the `log` facade.

use std::fmt;
use void_core::ModId;

/// Severity of a journal entry, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Severity {
    /// All severities, least severe first
    pub const ALL: [Severity; 8] = [
        Severity::Debug,
        Severity::Info,
        Severity::Notice,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
        Severity::Alert,
        Severity::Emergency,
    ];

    /// The `log` level an entry of this severity is forwarded at
    pub fn log_level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info | Severity::Notice => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            _ => log::Level::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Notice => "notice",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
            Severity::Alert => "alert",
            Severity::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

/// A single journal entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: EntryId,
    pub severity: Severity,
    /// Mod the entry is about, `None` for the loader itself
    pub source: Option<ModId>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "[{}] {}: {}", self.severity, source, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Ordered list of user-visible entries
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<LogEntry>,
    next_id: u64,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry and forward it to the `log` facade
    pub fn record(
        &mut self,
        severity: Severity,
        source: Option<&ModId>,
        message: impl Into<String>,
    ) -> EntryId {
        let message = message.into();
        let target = "void_mods::journal";
        match source {
            Some(id) => log::log!(target: target, severity.log_level(), "[{}] {}", id, message),
            None => log::log!(target: target, severity.log_level(), "{}", message),
        }

        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.push(LogEntry {
            id,
            severity,
            source: source.cloned(),
            message,
        });
        id
    }

    /// All entries in recording order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries whose severity is one of `severities`
    pub fn filter<'a>(&'a self, severities: &'a [Severity]) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| severities.contains(&entry.severity))
    }

    /// Entries about a given mod
    pub fn for_mod<'a>(&'a self, id: &'a ModId) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.source.as_ref() == Some(id))
    }

    /// Remove a single entry, returning it if present
    pub fn remove(&mut self, id: EntryId) -> Option<LogEntry> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
