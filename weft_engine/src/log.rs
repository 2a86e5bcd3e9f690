//! The build log returned alongside the outputs.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogEntry {
    /// A directive or pass that ran to completion.
    Applied { artifact: String, what: String },
    /// Something the build tolerated (unrecognized code left in place, a
    /// pass that had nothing to do, ...).
    Warning { artifact: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildLog {
    pub entries: Vec<LogEntry>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&mut self, artifact: &str, what: impl Into<String>) {
        let what = what.into();
        tracing::info!(artifact, "{what}");
        self.entries.push(LogEntry::Applied {
            artifact: artifact.to_string(),
            what,
        });
    }

    /// Record a non-fatal problem. Mirrored to `tracing::warn!`.
    pub fn warn(&mut self, artifact: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(artifact, "{message}");
        self.entries.push(LogEntry::Warning {
            artifact: artifact.to_string(),
            message,
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            LogEntry::Warning { message, .. } => Some(message.as_str()),
            _ => None,
        })
    }

    pub fn applied_steps(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            LogEntry::Applied { what, .. } => Some(what.as_str()),
            _ => None,
        })
    }

    pub fn extend(&mut self, other: BuildLog) {
        self.entries.extend(other.entries);
    }
}
