//! Per-socket UDP binding layer for a QUIC transport.
//!
//! A [`Binding`] owns a single UDP endpoint (local address, optionally a
//! fixed remote) and is the demultiplexing point between the datapath below
//! it and the per-connection workers above it. It routes incoming datagrams
//! to connections by connection ID, answers unattributed traffic with
//! stateless responses (Version Negotiation, Retry, Stateless Reset), and
//! never blocks the receive path: everything that can take time runs on a
//! worker thread.
//!
//! This crate performs no socket I/O itself. The datapath is injected via
//! the traits in [`datapath`](crate::Datapath), which makes the whole
//! receive/send surface drivable from tests.

mod binding;
mod coding;
mod connection;
mod datapath;
mod library;
mod listener;
mod lookup;
mod packet;
mod rundown;
mod shared;
#[cfg(test)]
mod tests;
mod token;
mod worker;

pub use crate::binding::{Binding, BindingError, StatelessOperationType};
pub use crate::connection::{ConnRef, Connection};
pub use crate::datapath::{
    AddressTuple, Datapath, DatapathBinding, DatapathError, RecvDatagram, SendContext,
    TestDatapathHooks,
};
pub use crate::library::{Library, LibraryConfig, SystemTimeSource, TimeSource};
pub use crate::listener::{Listener, ListenerRef, NewConnectionInfo, Session};
pub use crate::shared::{ConnectionId, ResetToken};
pub use crate::token::RETRY_TOKEN_LENGTH;

/// QUIC version 1 (RFC 9000)
pub const VERSION_1: u32 = 0x0000_0001;
/// IETF draft 29
pub const VERSION_DRAFT_29: u32 = 0xff00_001d;
/// IETF draft 28
pub const VERSION_DRAFT_28: u32 = 0xff00_001c;
/// IETF draft 27
pub const VERSION_DRAFT_27: u32 = 0xff00_001b;
/// Sentinel version carried by Version Negotiation packets
pub const VERSION_NEGOTIATION: u32 = 0x0000_0000;

/// Versions this endpoint is willing to speak, newest first. This is the
/// list advertised in outgoing Version Negotiation packets.
pub const SUPPORTED_VERSIONS: &[u32] = &[
    VERSION_1,
    VERSION_DRAFT_29,
    VERSION_DRAFT_28,
    VERSION_DRAFT_27,
];

/// Reserved-version bit pattern from RFC 9000 §15: versions of the form
/// `0x?a?a?a?a` will never be allocated and exist to exercise peers'
/// version negotiation logic.
pub(crate) const VERSION_RESERVED_MASK: u32 = 0x0f0f_0f0f;
pub(crate) const VERSION_RESERVED: u32 = 0x0a0a_0a0a;

pub(crate) fn is_version_supported(version: u32) -> bool {
    version == VERSION_NEGOTIATION || SUPPORTED_VERSIONS.contains(&version)
}

/// Whether `version` has the reserved bit pattern set in every nibble pair
pub fn is_version_reserved(version: u32) -> bool {
    version & VERSION_RESERVED_MASK == VERSION_RESERVED
}

//
// Wire-level constants exposed to users of the crate.
//

/// Length of the token trailing every stateless reset packet
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;
/// Smallest stateless reset we will ever emit (RFC 9000 §10.3)
pub const MIN_STATELESS_RESET_PACKET_LENGTH: usize = 39;
/// Baseline stateless reset length before randomization is added
pub const RECOMMENDED_STATELESS_RESET_PACKET_LENGTH: usize =
    25 + STATELESS_RESET_TOKEN_LENGTH;
/// Ceiling on concurrently tracked stateless responses per binding
pub const MAX_BINDING_STATELESS_OPERATIONS: usize = 100;
/// Age after which a tracked stateless response no longer suppresses a new
/// one for the same remote address
pub const STATELESS_OPERATION_EXPIRATION_MS: u64 = 100;
/// Minimum UDP payload carrying a client Initial (RFC 9000 §14.1)
pub const MIN_INITIAL_PACKET_LENGTH: usize = 1200;
/// Largest connection ID this endpoint will parse
pub const MAX_CID_SIZE: usize = 20;
