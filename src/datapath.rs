//! The interface the binding expects from the UDP datapath.
//!
//! The datapath owns sockets and I/O threads; this crate only defines the
//! contract. Receives arrive as a chain of datagrams on an arbitrary
//! thread, serialized per binding. Sends are fire-and-forget with an error
//! surfaced for logging. `delete` is the teardown barrier: it must not
//! return while any receive callback is still running.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Weak;

use bytes::BytesMut;
use thiserror::Error;

use crate::binding::Binding;

/// The 4-tuple a datagram arrived on (or is to be sent on)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTuple {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// One received UDP datagram
#[derive(Debug)]
pub struct RecvDatagram {
    pub buffer: BytesMut,
    pub tuple: AddressTuple,
}

impl RecvDatagram {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Buffers staged for a single send call
///
/// Mirrors a datapath that hands out send buffers from a pool: allocate a
/// context, fill one or more datagram buffers, hand the whole thing to
/// `send_to`/`send_from_to`. Dropping the context releases the buffers.
#[derive(Debug, Default)]
pub struct SendContext {
    datagrams: Vec<Vec<u8>>,
}

impl SendContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a datagram buffer of exactly `len` bytes and return it for
    /// filling
    pub fn alloc_send_datagram(&mut self, len: usize) -> &mut Vec<u8> {
        self.datagrams.push(vec![0; len]);
        self.datagrams.last_mut().unwrap()
    }

    /// Stage an already-built datagram
    pub fn push(&mut self, datagram: Vec<u8>) {
        self.datagrams.push(datagram);
    }

    pub fn datagrams(&self) -> &[Vec<u8>] {
        &self.datagrams
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatapathError {
    #[error("address not available: {0}")]
    InvalidAddress(SocketAddr),
    #[error("socket creation failed: {0}")]
    SocketFailure(&'static str),
    #[error("send failed: {0}")]
    SendFailure(&'static str),
}

/// Factory for per-binding datapath state
pub trait Datapath: Send + Sync {
    /// Create the UDP binding for the requested 2- or 4-tuple.
    fn create_binding(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<Box<dyn DatapathBinding>, DatapathError>;
}

/// One UDP socket as seen by its owning [`Binding`]
pub trait DatapathBinding: Send + Sync + fmt::Debug {
    /// Register the binding that receive and unreachable callbacks are
    /// delivered to. Called exactly once, before any traffic flows.
    fn set_receive_handler(&self, handler: Weak<Binding>);

    fn local_address(&self) -> SocketAddr;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn send_to(&self, remote: SocketAddr, ctx: SendContext) -> Result<(), DatapathError>;

    fn send_from_to(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        ctx: SendContext,
    ) -> Result<(), DatapathError>;

    /// Hand back datagrams the binding chose not to retain
    fn return_recv_datagrams(&self, datagrams: Vec<RecvDatagram>);

    /// Tear down the socket. Blocks until every in-flight receive callback
    /// has returned; after this no further callbacks are delivered.
    fn delete(&self);
}

/// Interception points for tests: drop or rewrite traffic at the
/// datapath boundary without a real network.
pub trait TestDatapathHooks: Send + Sync {
    /// Inspect (and possibly mutate) a received datagram. Return `true`
    /// to drop it.
    fn receive(&self, _datagram: &mut RecvDatagram) -> bool {
        false
    }

    /// Inspect (and possibly reroute) an outgoing send. Return `true` to
    /// drop it; the send still reports success to the caller.
    fn send(
        &self,
        _remote: &mut SocketAddr,
        _local: Option<&mut SocketAddr>,
        _ctx: &SendContext,
    ) -> bool {
        false
    }
}
