//! Per-slot consensus records.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The value held by a log slot once consensus has accepted one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Filler written when a slot is caught up without a value.
    Nop,
    /// A client payload appended to the log.
    Append {
        /// Opaque entry bytes.
        bytes: Bytes,
    },
    /// Discards every slot at or below `to` once learned.
    Truncate {
        /// Last position covered by the truncation.
        to: u64,
    },
}

/// One slot of the replicated log as stored by a replica.
///
/// A slot is reader-visible only once it is both performed (a value
/// was accepted under some ballot) and learned (quorum-confirmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Slot number, starting at 1. Position 0 means "no position".
    pub position: u64,
    /// Highest ballot promised for this slot.
    pub promised: u64,
    /// Ballot under which the value was accepted, if any.
    pub performed: Option<u64>,
    /// Whether a quorum has confirmed the accepted value.
    pub learned: bool,
    /// The accepted value. `None` until the slot has been performed.
    pub kind: Option<ActionKind>,
}

impl Action {
    /// An empty slot that has only seen promises.
    #[must_use]
    pub fn bare(position: u64) -> Self {
        Self {
            position,
            promised: 0,
            performed: None,
            learned: false,
            kind: None,
        }
    }

    /// A slot holding `kind`, accepted under `ballot` but not yet
    /// learned.
    #[must_use]
    pub fn performed(position: u64, ballot: u64, kind: ActionKind) -> Self {
        Self {
            position,
            promised: ballot,
            performed: Some(ballot),
            learned: false,
            kind: Some(kind),
        }
    }

    #[must_use]
    pub fn is_performed(&self) -> bool {
        self.performed.is_some()
    }

    /// Same slot, marked quorum-confirmed.
    #[must_use]
    pub fn into_learned(mut self) -> Self {
        self.learned = true;
        self
    }

    /// The append payload, when this slot holds one.
    #[must_use]
    pub fn append_bytes(&self) -> Option<&Bytes> {
        match &self.kind {
            Some(ActionKind::Append { bytes }) => Some(bytes),
            _ => None,
        }
    }

    /// The truncation boundary, when this slot holds one.
    #[must_use]
    pub fn truncate_to(&self) -> Option<u64> {
        match self.kind {
            Some(ActionKind::Truncate { to }) => Some(to),
            _ => None,
        }
    }
}
