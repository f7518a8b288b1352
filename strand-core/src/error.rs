//! Error kinds and structured `error_stack` context types.

use std::fmt;

/// Failure kinds surfaced by log operations.
///
/// Carried as the context of an `error_stack::Report`; attachments
/// hold the human-readable detail. Timeouts are not errors; the
/// client facade returns `Ok(None)` for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// A consensus round or collaborator failed. The writer that
    /// observed it is poisoned until the next election.
    Infrastructure,
    /// A read crossed pending or missing entries. Retryable once
    /// more of the log has been learned.
    BadRange,
    /// A write was issued without a valid ballot.
    NotElected,
    /// Recovery failed; terminal for the owning log instance.
    RecoveryFailed,
    /// The log, reader, or writer is shutting down.
    Closing,
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogError::Infrastructure => f.write_str("consensus operation failed"),
            LogError::BadRange => f.write_str("bad read range"),
            LogError::NotElected => f.write_str("no election has been performed"),
            LogError::RecoveryFailed => f.write_str("log recovery failed"),
            LogError::Closing => f.write_str("shutting down"),
        }
    }
}

impl std::error::Error for LogError {}

/// Error context: what operation was in progress.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext {
    pub operation: &'static str,
}

impl OperationContext {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self { operation }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "while {}", self.operation)
    }
}

impl OperationContext {
    pub const RECOVERING: Self = Self {
        operation: "recovering the local replica",
    };
    pub const ELECTING: Self = Self {
        operation: "running leader election",
    };
    pub const APPENDING: Self = Self {
        operation: "appending to the log",
    };
    pub const TRUNCATING: Self = Self {
        operation: "truncating the log",
    };
    pub const READING: Self = Self {
        operation: "reading the log",
    };
    pub const JOINING_GROUP: Self = Self {
        operation: "joining the replica group",
    };
    pub const OPENING_STORAGE: Self = Self {
        operation: "opening replica storage",
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            LogError::NotElected.to_string(),
            "no election has been performed"
        );
        assert_eq!(LogError::BadRange.to_string(), "bad read range");
        assert_eq!(
            OperationContext::ELECTING.to_string(),
            "while running leader election"
        );
    }
}
