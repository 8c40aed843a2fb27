//! The connection collaborator as the binding sees it.
//!
//! The handshake, crypto, and stream machinery live elsewhere; this type
//! carries exactly the state the binding and lookup tables interact with:
//! typed reference counts, the registered connection IDs, the receive
//! queue, worker affinity, and the pre-allocated shutdown operation used
//! when creation fails partway through on the receive path.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::binding::Binding;
use crate::library::Library;
use crate::listener::Session;
use crate::lookup::RemoteHashKey;
use crate::packet::ParsedDatagram;
use crate::shared::ConnectionId;
use crate::worker::{Operation, Worker};

/// Rough per-connection cost charged against the handshake memory budget
/// while a connection has not completed its handshake
pub(crate) const HANDSHAKE_CONNECTION_ESTIMATE: u64 = 16 * 1024;

/// Why a reference to a connection is held. Roles make leaks attributable:
/// a stuck `LookupResult` count points at a lookup caller that never
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRef {
    /// The reference held by whoever created the connection
    HandleOwner = 0,
    /// A reference handed out by a lookup table hit
    LookupResult = 1,
}

pub struct Connection {
    library: Arc<Library>,
    session: Arc<Session>,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    refs: [AtomicU32; 2],
    source_cids: Mutex<Vec<ConnectionId>>,
    remote_hash_key: Mutex<Option<RemoteHashKey>>,
    worker: Mutex<Option<Arc<Worker>>>,
    /// Counted reference on the owning binding, held from successful
    /// creation until shutdown
    binding: Mutex<Option<Arc<Binding>>>,
    recv_queue: Mutex<VecDeque<Vec<ParsedDatagram>>>,
    processed_datagrams: AtomicUsize,
    /// Datagrams that arrived carrying an already-validated retry token;
    /// such a connection needs no further address validation
    validated_datagrams: AtomicUsize,
    unreachable_events: Mutex<Vec<SocketAddr>>,
    /// Claim flag for the single pre-allocated shutdown operation; see
    /// [`Connection::try_claim_backup_oper`]
    backup_oper_used: AtomicBool,
    shut_down: AtomicBool,
}

impl Connection {
    /// Initialize a server-side connection for an incoming datagram,
    /// against the library's unregistered session. The first source CID is
    /// chosen here so the connection can be entered into lookup tables
    /// immediately.
    pub(crate) fn accept(library: &Arc<Library>, tuple_local: SocketAddr, tuple_remote: SocketAddr) -> Arc<Self> {
        let mut rng = StdRng::from_entropy();
        let cid = ConnectionId::random(&mut rng, library.config().cid_total_length as usize);
        library.add_handshake_memory(HANDSHAKE_CONNECTION_ESTIMATE);
        let conn = Arc::new(Self::new_inner(
            library,
            library.unregistered_session(),
            tuple_local,
            tuple_remote,
        ));
        conn.source_cids.lock().push(cid);
        conn
    }

    /// Construct a locally-initiated connection. The caller registers its
    /// source CIDs through the binding.
    pub fn connect(
        library: &Arc<Library>,
        session: Arc<Session>,
        local_address: SocketAddr,
        remote_address: SocketAddr,
    ) -> Arc<Self> {
        library.add_handshake_memory(HANDSHAKE_CONNECTION_ESTIMATE);
        Arc::new(Self::new_inner(library, session, local_address, remote_address))
    }

    fn new_inner(
        library: &Arc<Library>,
        session: Arc<Session>,
        local_address: SocketAddr,
        remote_address: SocketAddr,
    ) -> Self {
        Self {
            library: library.clone(),
            session,
            local_address,
            remote_address,
            refs: [AtomicU32::new(1), AtomicU32::new(0)],
            source_cids: Mutex::new(Vec::new()),
            remote_hash_key: Mutex::new(None),
            worker: Mutex::new(None),
            binding: Mutex::new(None),
            recv_queue: Mutex::new(VecDeque::new()),
            processed_datagrams: AtomicUsize::new(0),
            validated_datagrams: AtomicUsize::new(0),
            unreachable_events: Mutex::new(Vec::new()),
            backup_oper_used: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    //
    // Typed reference accounting. Memory lifetime is carried by `Arc`;
    // the counts exist so each retention site is attributable and so
    // teardown can assert none are outstanding.
    //

    pub fn add_ref(&self, role: ConnRef) {
        self.refs[role as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn release_ref(&self, role: ConnRef) {
        let prev = self.refs[role as usize].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "released {role:?} ref that was never taken");
    }

    pub fn ref_count(&self, role: ConnRef) -> u32 {
        self.refs[role as usize].load(Ordering::Relaxed)
    }

    //
    // Connection ID registry, maintained by the lookup tables.
    //

    pub(crate) fn push_source_cid(&self, cid: ConnectionId) {
        self.source_cids.lock().push(cid);
    }

    pub(crate) fn forget_source_cid(&self, cid: &ConnectionId) {
        self.source_cids.lock().retain(|c| c != cid);
    }

    pub fn source_cids(&self) -> Vec<ConnectionId> {
        self.source_cids.lock().clone()
    }

    pub fn has_source_cid(&self, cid: &ConnectionId) -> bool {
        self.source_cids.lock().iter().any(|c| c == cid)
    }

    /// Drop the provisional first CID of a connection that failed to enter
    /// the lookup tables
    pub(crate) fn clear_source_cids(&self) {
        self.source_cids.lock().clear();
    }

    pub(crate) fn set_remote_hash_key(&self, key: RemoteHashKey) {
        let mut slot = self.remote_hash_key.lock();
        debug_assert!(slot.is_none());
        *slot = Some(key);
    }

    pub(crate) fn take_remote_hash_key(&self) -> Option<RemoteHashKey> {
        self.remote_hash_key.lock().take()
    }

    pub(crate) fn has_remote_hash_entry(&self) -> bool {
        self.remote_hash_key.lock().is_some()
    }

    //
    // Worker affinity: all operations for one connection run on exactly
    // one worker.
    //

    pub(crate) fn assign_worker(&self, worker: Arc<Worker>) {
        let mut slot = self.worker.lock();
        debug_assert!(slot.is_none());
        *slot = Some(worker);
    }

    pub(crate) fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.lock().clone()
    }

    pub(crate) fn set_binding(&self, binding: Arc<Binding>) {
        *self.binding.lock() = Some(binding);
    }

    /// Append a subchain of datagrams to the receive queue, preserving
    /// arrival order, and nudge the owning worker.
    pub(crate) fn queue_recv_datagrams(self: &Arc<Self>, chain: Vec<ParsedDatagram>) {
        self.recv_queue.lock().push_back(chain);
        if let Some(worker) = self.worker() {
            worker.queue_operation(Operation::ConnRecv { conn: self.clone() });
        }
    }

    /// Worker-side drain of the receive queue. Packet-level processing
    /// (decryption, frames) happens in the transport machinery outside
    /// this crate; the datagram buffers are consumed here.
    pub(crate) fn process_recv(&self) {
        let mut queue = self.recv_queue.lock();
        while let Some(chain) = queue.pop_front() {
            let validated = chain.iter().filter(|p| p.packet.valid_token).count();
            self.validated_datagrams
                .fetch_add(validated, Ordering::Relaxed);
            self.processed_datagrams
                .fetch_add(chain.len(), Ordering::Relaxed);
        }
    }

    /// Subchains currently queued but not yet drained by the worker
    pub fn queued_chain_lengths(&self) -> Vec<usize> {
        self.recv_queue.lock().iter().map(|c| c.len()).collect()
    }

    /// Header form of each queued packet, in delivery order
    #[cfg(test)]
    pub(crate) fn queued_packet_shapes(&self) -> Vec<Vec<bool>> {
        self.recv_queue
            .lock()
            .iter()
            .map(|chain| chain.iter().map(|p| p.packet.is_short_header).collect())
            .collect()
    }

    pub fn processed_datagrams(&self) -> usize {
        self.processed_datagrams.load(Ordering::Relaxed)
    }

    pub fn validated_datagrams(&self) -> usize {
        self.validated_datagrams.load(Ordering::Relaxed)
    }

    pub(crate) fn queue_unreachable(&self, remote: SocketAddr) {
        self.unreachable_events.lock().push(remote);
    }

    pub fn unreachable_events(&self) -> Vec<SocketAddr> {
        self.unreachable_events.lock().clone()
    }

    /// Claim the pre-allocated shutdown operation. At most one caller ever
    /// wins; creation-failure cleanup uses this so that tearing down a
    /// half-created connection allocates nothing on the receive path.
    pub(crate) fn try_claim_backup_oper(&self) -> bool {
        self.backup_oper_used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Final, idempotent teardown: returns the binding reference and the
    /// handshake memory charge.
    pub fn shutdown_silent(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(remote = %self.remote_address, "connection silently shut down");
        self.library
            .sub_handshake_memory(HANDSHAKE_CONNECTION_ESTIMATE);
        if let Some(binding) = self.binding.lock().take() {
            self.library.release_binding(&binding);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local_address)
            .field("remote", &self.remote_address)
            .field("source_cids", &*self.source_cids.lock())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

/// RAII handle for a `LookupResult` reference; dropping it releases the
/// role count.
#[derive(Debug)]
pub(crate) struct LookupRef(Arc<Connection>);

impl LookupRef {
    pub fn acquire(conn: &Arc<Connection>) -> Self {
        conn.add_ref(ConnRef::LookupResult);
        Self(conn.clone())
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.0
    }
}

impl std::ops::Deref for LookupRef {
    type Target = Arc<Connection>;
    fn deref(&self) -> &Arc<Connection> {
        &self.0
    }
}

impl Drop for LookupRef {
    fn drop(&mut self) {
        self.0.release_ref(ConnRef::LookupResult);
    }
}
