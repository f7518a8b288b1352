//! Collaborators for the strand replicated log.
//!
//! This crate houses everything the log core consumes but does not
//! own: the persistent [`Replica`] (the acceptor side of the
//! protocol), the [`Coordinator`] (the proposer bound to one
//! writer's ballot), the [`recover`] procedure that brings a fresh
//! replica up to the quorum's learned prefix, and the plumbing that
//! connects them: the in-process [`Fabric`] transport, the
//! [`Network`] peer set, and the [`Group`] naming service.
//!
//! ```text
//! Coordinator ──► Network ──► Fabric ──► Replica (acceptor task)
//!                    ▲                      │
//!                    └──── Group watch ─────┘ (membership-backed peers)
//! ```

#![warn(clippy::pedantic)]

pub mod coordinator;
pub mod group;
pub mod network;
pub(crate) mod protocol;
pub mod recover;
pub mod replica;
pub(crate) mod storage;
pub mod transport;

pub use coordinator::{Coordinator, MAX_ENTRY_SIZE};
pub use group::{Group, Membership};
pub use network::Network;
pub use recover::recover;
pub use replica::Replica;
pub use transport::{Fabric, Pid};
