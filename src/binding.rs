//! The per-socket binding: one UDP endpoint and everything needed to route
//! its traffic.
//!
//! A binding simultaneously serves many connections indexed by two
//! different keys, absorbs unsolicited datagrams that belong to no
//! connection yet, answers some of those statelessly under rate and memory
//! pressure, and bridges receive callbacks arriving on datapath threads to
//! workers that do the slow work. The receive path never blocks and always
//! returns buffers it does not explicitly retain.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use ring::{digest, hmac};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::connection::{ConnRef, Connection, LookupRef};
use crate::datapath::{DatapathBinding, DatapathError, RecvDatagram, SendContext};
use crate::library::Library;
use crate::listener::{family_rank_of, FamilyRank, Listener, ListenerRef, NewConnectionInfo};
use crate::lookup::{AddRemoteHashResult, Lookup};
use crate::packet::{
    encode_retry_v1, encode_version_negotiation, validate_long_header_v1, LongHeaderType,
    ParsedDatagram, RecvPacket,
};
use crate::shared::{ConnectionId, ResetToken};
use crate::token::{RetryTokenContents, RETRY_TOKEN_LENGTH};
use crate::worker::{Operation, Worker};
use crate::{
    is_version_supported, MAX_BINDING_STATELESS_OPERATIONS, MIN_STATELESS_RESET_PACKET_LENGTH,
    RECOMMENDED_STATELESS_RESET_PACKET_LENGTH, STATELESS_OPERATION_EXPIRATION_MS,
    STATELESS_RESET_TOKEN_LENGTH, SUPPORTED_VERSIONS, VERSION_NEGOTIATION, VERSION_RESERVED,
    VERSION_RESERVED_MASK,
};

const _: () = assert!(
    digest::SHA256_OUTPUT_LEN >= STATELESS_RESET_TOKEN_LENGTH,
    "reset token must fit in the hash output"
);

const RESET_TOKEN_SALT_LENGTH: usize = 20;

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("datapath: {0}")]
    Datapath(#[from] DatapathError),
}

/// The three responses an endpoint can produce without per-connection
/// state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatelessOperationType {
    VersionNegotiation,
    StatelessReset,
    Retry,
}

/// Tracking state for one in-flight stateless response.
///
/// Shared between the binding's tracker (which ages it out) and the worker
/// (which processes it). The `is_processed` / `is_expired` pair is a
/// last-writer handshake: each flag is set exactly once, observation is
/// serialized by the tracker lock, and the context is only released from
/// both structures once the side still holding it lets go.
pub(crate) struct StatelessContext {
    binding: Arc<Binding>,
    worker: Arc<Worker>,
    remote_address: SocketAddr,
    creation_time_ms: u64,
    /// The retained receive subchain the response is derived from
    datagrams: Mutex<Vec<ParsedDatagram>>,
    has_binding_ref: AtomicBool,
    is_processed: AtomicBool,
    is_expired: AtomicBool,
}

impl StatelessContext {
    pub(crate) fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }
}

#[derive(Default)]
struct StatelessTracker {
    /// Remote address -> pending context; enforces one in-flight response
    /// per remote
    table: FxHashMap<SocketAddr, Arc<StatelessContext>>,
    /// Same contexts in admission order, oldest first, for aging
    list: VecDeque<Arc<StatelessContext>>,
}

pub struct Binding {
    library: Arc<Library>,
    exclusive: bool,
    server_owned: bool,
    connected: bool,
    /// Counted references: the creator plus every cross-thread retention
    /// (connections, stateless contexts). Zero means teardown.
    ref_count: AtomicU32,
    /// Stable reserved-pattern version advertised in Version Negotiation
    random_reserved_version: u32,
    datapath_binding: Box<dyn DatapathBinding>,
    /// Keyed hash deriving stateless reset tokens from CIDs; per-binding
    /// salt makes tokens binding-independent
    reset_token_hash: Mutex<hmac::Key>,
    listeners: RwLock<Vec<Arc<Listener>>>,
    lookup: Lookup,
    stateless: Mutex<StatelessTracker>,
}

enum Preprocessed {
    Deliverable(ParsedDatagram),
    /// Retained by a queued stateless operation
    Retained,
    Release(RecvDatagram),
}

enum RetryDecision {
    Queue,
    Proceed { valid_token: bool },
    Drop,
}

impl Binding {
    /// Create a binding over a datapath socket for the requested 2- or
    /// 4-tuple. `share_binding` permits multiple connections (and
    /// listeners) to use the socket; a non-shared binding is exclusive to
    /// one connection and ignores destination CIDs.
    pub fn initialize(
        library: Arc<Library>,
        share_binding: bool,
        server_owned: bool,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Result<Arc<Self>, BindingError> {
        let mut rng = StdRng::from_entropy();
        let random_reserved_version =
            (rng.gen::<u32>() & !VERSION_RESERVED_MASK) | VERSION_RESERVED;
        let mut salt = [0u8; RESET_TOKEN_SALT_LENGTH];
        rng.fill_bytes(&mut salt);
        let reset_token_hash = hmac::Key::new(hmac::HMAC_SHA256, &salt);

        // Everything initialized before this call is released in reverse
        // order by drop if socket creation fails.
        let datapath_binding = library.datapath().create_binding(local, remote)?;

        let binding = Arc::new(Self {
            library,
            exclusive: !share_binding,
            server_owned,
            connected: remote.is_some(),
            ref_count: AtomicU32::new(1),
            random_reserved_version,
            datapath_binding,
            reset_token_hash: Mutex::new(reset_token_hash),
            listeners: RwLock::new(Vec::new()),
            lookup: Lookup::new(),
            stateless: Mutex::new(StatelessTracker::default()),
        });
        binding
            .datapath_binding
            .set_receive_handler(Arc::downgrade(&binding));
        debug!(
            local = %binding.datapath_binding.local_address(),
            remote = ?binding.datapath_binding.remote_address(),
            "binding created"
        );
        Ok(binding)
    }

    /// Final teardown, run by the last reference release. The datapath
    /// delete is the memory-safety anchor: it blocks until every receive
    /// callback has returned, so nothing can race the cleanup below it.
    pub(crate) fn uninitialize(&self) {
        debug!(local = %self.datapath_binding.local_address(), "binding cleaning up");
        assert_eq!(self.ref_count.load(Ordering::Acquire), 0);
        assert!(self.listeners.read().is_empty());

        self.datapath_binding.delete();

        // Any contexts still tracked were kept only for dedup; their
        // workers have drained, so they must be processed.
        let mut tracker = self.stateless.lock();
        while let Some(ctx) = tracker.list.pop_front() {
            tracker.table.remove(&ctx.remote_address);
            debug_assert!(ctx.is_processed.load(Ordering::Acquire));
        }
        debug_assert!(tracker.table.is_empty());
        drop(tracker);

        debug!(local = %self.datapath_binding.local_address(), "binding destroyed");
    }

    /// Take a counted reference unless teardown has begun
    pub(crate) fn try_add_ref(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns true when this was the last reference and the caller must
    /// uninitialize.
    pub(crate) fn release_ref(&self) -> bool {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev == 1
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_server_owned(&self) -> bool {
        self.server_owned
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn local_address(&self) -> SocketAddr {
        self.datapath_binding.local_address()
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub(crate) fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    /// Log the binding and its listeners, for diagnostics
    pub fn trace_rundown(&self) {
        debug!(
            local = %self.datapath_binding.local_address(),
            remote = ?self.datapath_binding.remote_address(),
            refs = self.ref_count(),
            "binding rundown"
        );
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            debug!(address = ?listener.local_address(), wildcard = listener.is_wildcard(), "listener");
        }
    }

    //
    // Listener registry. The list is kept sorted by family (descending),
    // then specific addresses before wildcards, then insertion order, so
    // the first match during a scan is the most specific one.
    //

    pub fn has_listener_registered(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    /// Insert a listener at its sort position unless an existing listener
    /// already covers the same address with an overlapping ALPN. The first
    /// listener upgrades the lookup to its partitioned form; if that
    /// fails, the registration is rolled back.
    pub fn register_listener(&self, new: &Arc<Listener>) -> bool {
        let mut added = true;
        let mut maximize = false;
        {
            let mut listeners = self.listeners.write();
            let mut insert_at = listeners.len();
            for (i, existing) in listeners.iter().enumerate() {
                if new.family_rank() > existing.family_rank() {
                    insert_at = i;
                    break;
                }
                if new.family_rank() != existing.family_rank() {
                    continue;
                }
                if !new.is_wildcard() && existing.is_wildcard() {
                    insert_at = i;
                    break;
                }
                if new.is_wildcard() != existing.is_wildcard() {
                    continue;
                }
                if new.family_rank() != FamilyRank::Unspecified && !new.same_ip(existing) {
                    continue;
                }
                if new.session().has_alpn_overlap(existing.session()) {
                    warn!(
                        address = ?existing.local_address(),
                        "listener already registered on overlapping ALPN"
                    );
                    added = false;
                    break;
                }
            }
            if added {
                maximize = listeners.is_empty();
                listeners.insert(insert_at, new.clone());
            }
        }

        if added
            && maximize
            && !self
                .lookup
                .maximize_partitioning(self.library.worker_parallelism())
        {
            self.unregister_listener(new);
            added = false;
        }

        added
    }

    /// Find the listener accepting `info`, holding it against teardown.
    /// The first listener whose ALPN set matches ends the search whether
    /// or not it can still be referenced.
    pub fn get_listener(&self, info: &NewConnectionInfo) -> Option<ListenerRef> {
        let listeners = self.listeners.read();
        for existing in listeners.iter() {
            if existing.family_rank() != FamilyRank::Unspecified {
                if family_rank_of(&info.local_address) != existing.family_rank()
                    || (!existing.is_wildcard() && !existing.ip_matches(&info.local_address))
                {
                    continue;
                }
            }
            if existing.session().matches_alpn(info) {
                return ListenerRef::acquire(existing);
            }
        }
        None
    }

    pub fn unregister_listener(&self, listener: &Arc<Listener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    //
    // Connection ID registry, delegated to the lookup tables. Called by
    // the connection machinery as CIDs are issued, retired, and moved.
    //

    pub fn add_source_connection_id(&self, conn: &Arc<Connection>, cid: ConnectionId) -> bool {
        self.lookup.add_local_cid(conn, cid)
    }

    pub fn remove_source_connection_id(&self, conn: &Arc<Connection>, cid: &ConnectionId) {
        self.lookup.remove_local_cid(conn, cid)
    }

    pub fn remove_connection(&self, conn: &Arc<Connection>) {
        if conn.has_remote_hash_entry() {
            self.lookup.remove_remote_hash(conn);
        }
        self.lookup.remove_local_cids(conn);
    }

    pub fn move_source_connection_ids(
        src: &Arc<Binding>,
        dst: &Arc<Binding>,
        conn: &Arc<Connection>,
    ) {
        src.lookup.move_local_cids(&dst.lookup, conn);
    }

    /// Once the handshake confirms, the peer routes by our CIDs alone and
    /// the remote-hash entry is no longer needed.
    pub fn on_connection_handshake_confirmed(&self, conn: &Arc<Connection>) {
        if conn.has_remote_hash_entry() {
            self.lookup.remove_remote_hash(conn);
        }
    }

    //
    // Stateless operation tracker.
    //

    /// Admit a new stateless operation for the remote the subchain came
    /// from: age out stale contexts, enforce the per-binding cap, and
    /// refuse a second concurrent response to the same remote. On refusal
    /// the subchain is handed back for release.
    fn create_stateless_operation(
        self: &Arc<Self>,
        worker: Arc<Worker>,
        chain: Vec<ParsedDatagram>,
    ) -> Result<Arc<StatelessContext>, Vec<ParsedDatagram>> {
        let now_ms = self.library.time().now_ms();
        let remote = chain[0].datagram.tuple.remote;
        let mut tracker = self.stateless.lock();

        // Age out from the head; the list is in admission order.
        while let Some(oldest) = tracker.list.front() {
            if now_ms.saturating_sub(oldest.creation_time_ms) < STATELESS_OPERATION_EXPIRATION_MS
            {
                break;
            }
            let oldest = tracker.list.pop_front().expect("checked front");
            oldest.is_expired.store(true, Ordering::Release);
            tracker.table.remove(&oldest.remote_address);
            // If the worker has already processed it, dropping our
            // references here frees it; otherwise the worker's reference
            // keeps it alive until release.
        }

        if tracker.list.len() >= MAX_BINDING_STATELESS_OPERATIONS {
            debug!("packet dropped: max binding stateless operations reached");
            return Err(chain);
        }

        if tracker.table.contains_key(&remote) {
            debug!(%remote, "packet dropped: stateless operation already pending");
            return Err(chain);
        }

        let ctx = Arc::new(StatelessContext {
            binding: self.clone(),
            worker,
            remote_address: remote,
            creation_time_ms: now_ms,
            datagrams: Mutex::new(chain),
            has_binding_ref: AtomicBool::new(false),
            is_processed: AtomicBool::new(false),
            is_expired: AtomicBool::new(false),
        });
        tracker.table.insert(remote, ctx.clone());
        tracker.list.push_back(ctx.clone());
        Ok(ctx)
    }

    /// Pick a worker, admit the operation, pin the binding, and enqueue.
    /// Any failure after admission unwinds through
    /// [`Self::release_stateless_operation`] and hands the subchain back.
    fn queue_stateless_operation(
        self: &Arc<Self>,
        ty: StatelessOperationType,
        chain: Vec<ParsedDatagram>,
    ) -> Result<(), Vec<ParsedDatagram>> {
        let worker = self.library.get_worker();
        if worker.is_overloaded() {
            debug!("packet dropped: worker overloaded for stateless operation");
            return Err(chain);
        }

        let ctx = self.create_stateless_operation(worker, chain)?;

        if self.try_add_ref() {
            ctx.has_binding_ref.store(true, Ordering::Release);
        } else {
            debug!("packet dropped: binding clean up in progress");
            return Err(self
                .release_stateless_operation(&ctx, false)
                .unwrap_or_default());
        }

        if !ctx
            .worker
            .queue_operation(Operation::Stateless { ty, ctx: ctx.clone() })
        {
            debug!("packet dropped: worker queue closed");
            return Err(self
                .release_stateless_operation(&ctx, false)
                .unwrap_or_default());
        }

        trace!(?ty, "stateless operation queued");
        Ok(())
    }

    /// Build and send the response for a queued stateless operation.
    /// Runs on the context's worker; failures drop silently, which is
    /// always permissible for stateless responses.
    pub(crate) fn process_stateless_operation(
        &self,
        ty: StatelessOperationType,
        ctx: &StatelessContext,
    ) {
        let datagrams = ctx.datagrams.lock();
        let Some(entry) = datagrams.first() else {
            return;
        };
        let packet = &entry.packet;
        let tuple = entry.datagram.tuple;
        trace!(?ty, remote = %tuple.remote, "executing stateless operation");

        let mut send_ctx = SendContext::new();
        match ty {
            StatelessOperationType::VersionNegotiation => {
                debug_assert!(packet.src_cid.is_some());
                let buf = encode_version_negotiation(
                    packet,
                    rand::thread_rng().gen::<u8>(),
                    self.random_reserved_version,
                    SUPPORTED_VERSIONS,
                );
                send_ctx.push(buf);
            }
            StatelessOperationType::StatelessReset => {
                debug_assert!(packet.src_cid.is_none());
                // Requirements: smaller than the packet being answered (to
                // kill reset loops), above the RFC 9000 minimum, and random
                // enough that middleboxes cannot classify it. Three bits
                // of length randomness on top of the recommended size.
                let mut length = RECOMMENDED_STATELESS_RESET_PACKET_LENGTH
                    + (rand::thread_rng().gen::<u8>() >> 5) as usize;
                if length >= entry.datagram.len() {
                    length = entry.datagram.len() - 1;
                }
                debug_assert!(length >= MIN_STATELESS_RESET_PACKET_LENGTH);

                let token = self.generate_stateless_reset_token(&packet.dst_cid);
                let buf = send_ctx.alloc_send_datagram(length);
                rand::thread_rng().fill_bytes(&mut buf[..length - STATELESS_RESET_TOKEN_LENGTH]);
                buf[0] = 0x40 | (buf[0] & 0x3b) | if packet.key_phase { 0x04 } else { 0 };
                buf[length - STATELESS_RESET_TOKEN_LENGTH..].copy_from_slice(token.as_bytes());
                trace!(token = %token, "stateless reset built");
            }
            StatelessOperationType::Retry => {
                debug_assert!(packet.src_cid.is_some());
                let Some(src_cid) = packet.src_cid.as_ref() else {
                    return;
                };
                let mut rng = rand::thread_rng();
                let new_cid = ConnectionId::random(
                    &mut rng,
                    self.library.config().cid_total_length as usize,
                );
                let contents = RetryTokenContents {
                    timestamp_ms: self.library.time().epoch_ms(),
                    remote_address: tuple.remote,
                    orig_dst_cid: packet.dst_cid,
                };
                let key = self.library.current_retry_key();
                let token = contents.seal(&key, &new_cid);
                let buf =
                    encode_retry_v1(packet.version, src_cid, &new_cid, &packet.dst_cid, &token);
                send_ctx.push(buf);
                trace!(%new_cid, orig = %packet.dst_cid, "retry built");
            }
        }
        drop(datagrams);

        let _ = self.send_from_to(tuple.local, tuple.remote, send_ctx);
    }

    /// Mark the context processed and release whatever it still holds.
    /// With `return_datagram` the retained subchain goes back to the
    /// datapath; otherwise it is handed back to the caller. Exactly one of
    /// the ager and this release frees the context, whichever runs last.
    pub(crate) fn release_stateless_operation(
        &self,
        ctx: &Arc<StatelessContext>,
        return_datagram: bool,
    ) -> Option<Vec<ParsedDatagram>> {
        let chain = std::mem::take(&mut *ctx.datagrams.lock());
        let handed_back = if return_datagram {
            self.datapath_binding
                .return_recv_datagrams(chain.into_iter().map(|p| p.datagram).collect());
            None
        } else {
            Some(chain)
        };

        {
            let _tracker = self.stateless.lock();
            ctx.is_processed.store(true, Ordering::Release);
            // The expired flag decides who frees; with shared handles the
            // actual free is the drop of the last clone, which cannot
            // happen before both flags are set.
        }

        if ctx.has_binding_ref.load(Ordering::Acquire) {
            self.library.release_binding(&ctx.binding);
        }

        handed_back
    }

    /// Stateless reset for an unattributed short-header packet
    fn queue_stateless_reset(
        self: &Arc<Self>,
        chain: Vec<ParsedDatagram>,
    ) -> Result<(), Vec<ParsedDatagram>> {
        debug_assert!(!self.exclusive);
        debug_assert!(chain[0].packet.is_short_header);

        if chain[0].datagram.len() <= MIN_STATELESS_RESET_PACKET_LENGTH {
            debug!("packet dropped: too short for stateless reset");
            return Err(chain);
        }

        if self.exclusive {
            // Without CIDs there is no token to derive, so exclusive
            // bindings never send resets.
            debug!("packet dropped: no stateless reset on exclusive binding");
            return Err(chain);
        }

        self.queue_stateless_operation(StatelessOperationType::StatelessReset, chain)
    }

    //
    // Receive pipeline.
    //

    /// Validate a datagram's invariant header. Long-header packets whose
    /// version we do not speak either trigger Version Negotiation (when a
    /// listener could eventually accept a supported version) or drop.
    fn preprocess_datagram(self: &Arc<Self>, datagram: RecvDatagram) -> Preprocessed {
        let short_cid_len = if self.exclusive {
            0
        } else {
            self.library.config().cid_total_length as usize
        };
        let packet = match RecvPacket::decode_invariant(&datagram.buffer, short_cid_len) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("packet dropped: {e}");
                return Preprocessed::Release(datagram);
            }
        };

        if !packet.is_short_header && !is_version_supported(packet.version) {
            if !self.has_listener_registered() {
                debug!(version = packet.version, "packet dropped: no listener to negotiate versions");
                return Preprocessed::Release(datagram);
            }
            return match self.queue_stateless_operation(
                StatelessOperationType::VersionNegotiation,
                vec![ParsedDatagram { datagram, packet }],
            ) {
                Ok(()) => Preprocessed::Retained,
                Err(mut chain) => {
                    Preprocessed::Release(chain.pop().expect("chain of one").datagram)
                }
            };
        }

        Preprocessed::Deliverable(ParsedDatagram { datagram, packet })
    }

    /// Datapath receive callback. Splits the chain into subchains by
    /// destination CID (skipped on exclusive bindings, which route
    /// everything to their one connection), keeps handshake packets ahead
    /// of data packets within a subchain so the head packet decides
    /// whether a connection can be created, and returns everything not
    /// retained.
    pub fn receive(self: &Arc<Self>, chain: Vec<RecvDatagram>) {
        let mut release: Vec<RecvDatagram> = Vec::new();
        // The current subchain, long-header packets ahead of the rest
        let mut handshake: Vec<ParsedDatagram> = Vec::new();
        let mut data: Vec<ParsedDatagram> = Vec::new();
        let hooks = self.library.test_hooks();

        for mut datagram in chain {
            if let Some(hooks) = &hooks {
                if hooks.receive(&mut datagram) {
                    debug!("packet dropped: test hook");
                    release.push(datagram);
                    continue;
                }
            }

            let parsed = match self.preprocess_datagram(datagram) {
                Preprocessed::Deliverable(parsed) => parsed,
                Preprocessed::Retained => continue,
                Preprocessed::Release(datagram) => {
                    release.push(datagram);
                    continue;
                }
            };
            debug_assert!(!parsed.packet.dst_cid.is_empty() || self.exclusive);

            let subchain_cid = handshake
                .first()
                .or_else(|| data.first())
                .map(|p| p.packet.dst_cid);
            if !self.exclusive
                && subchain_cid.is_some_and(|cid| cid != parsed.packet.dst_cid)
            {
                let mut subchain = std::mem::take(&mut handshake);
                subchain.append(&mut data);
                if let Err(returned) = self.deliver_datagrams(subchain) {
                    release.extend(returned.into_iter().map(|p| p.datagram));
                }
            }

            if parsed.packet.is_handshake() {
                handshake.push(parsed);
            } else {
                data.push(parsed);
            }
        }

        if !handshake.is_empty() || !data.is_empty() {
            let mut subchain = handshake;
            subchain.append(&mut data);
            if let Err(returned) = self.deliver_datagrams(subchain) {
                release.extend(returned.into_iter().map(|p| p.datagram));
            }
        }

        if !release.is_empty() {
            self.datapath_binding.return_recv_datagrams(release);
        }
    }

    /// Route one subchain: to an existing connection when a lookup hits,
    /// otherwise create a connection or answer statelessly. `Err` hands
    /// the subchain back for release.
    fn deliver_datagrams(
        self: &Arc<Self>,
        mut chain: Vec<ParsedDatagram>,
    ) -> Result<(), Vec<ParsedDatagram>> {
        // Client-owned bindings always control the destination CID, as do
        // short-header packets on servers. Server long headers carry a
        // client-chosen destination CID with no local meaning, so those
        // route by (remote address, source CID) instead.
        let found = {
            let head = &chain[0];
            if !self.server_owned || head.packet.is_short_header {
                self.lookup.find_by_local_cid(&head.packet.dst_cid)
            } else {
                head.packet.src_cid.as_ref().and_then(|scid| {
                    self.lookup
                        .find_by_remote_hash(head.datagram.tuple.remote, scid)
                })
            }
        };

        let conn = match found {
            Some(conn) => conn,
            None => {
                // Handshake packets sort first, so the head of the chain
                // is the packet that decides whether a connection can be
                // created.
                if self.exclusive {
                    debug!("packet dropped: no connection on exclusive binding");
                    return Err(chain);
                }

                if chain[0].packet.is_short_header {
                    return self.queue_stateless_reset(chain);
                }

                if chain[0].packet.version == VERSION_NEGOTIATION {
                    debug!("packet dropped: version negotiation packet without connection");
                    return Err(chain);
                }

                debug_assert!(is_version_supported(chain[0].packet.version));

                if chain[0].packet.long_header_type() != Ok(LongHeaderType::Initial) {
                    debug!("packet dropped: non-initial packet without connection");
                    return Err(chain);
                }

                let token = match validate_long_header_v1(
                    &chain[0].packet,
                    &chain[0].datagram.buffer,
                    true,
                ) {
                    Ok(token) => token,
                    Err(e) => {
                        debug!("packet dropped: {e}");
                        return Err(chain);
                    }
                };

                if !self.has_listener_registered() {
                    debug!("packet dropped: no listener to accept new connection");
                    return Err(chain);
                }

                debug_assert!(self.server_owned);

                match self.should_retry_connection(
                    &chain[0].packet,
                    &token,
                    chain[0].datagram.tuple.remote,
                ) {
                    RetryDecision::Queue => {
                        return self
                            .queue_stateless_operation(StatelessOperationType::Retry, chain);
                    }
                    RetryDecision::Drop => return Err(chain),
                    RetryDecision::Proceed { valid_token } => {
                        if valid_token {
                            chain[0].packet.valid_token = true;
                        }
                        match self.create_connection(&chain[0]) {
                            Some(conn) => conn,
                            None => return Err(chain),
                        }
                    }
                }
            }
        };

        let delivered = chain.len();
        conn.connection().queue_recv_datagrams(chain);
        trace!(datagrams = delivered, "subchain delivered");
        Ok(())
    }

    /// Decide between creating the connection, demanding a Retry first,
    /// and dropping. A supplied token must always validate; absent a
    /// token, Retry is demanded once handshake memory reaches the
    /// configured fraction of total memory.
    fn should_retry_connection(
        &self,
        packet: &RecvPacket,
        token: &[u8],
        remote: SocketAddr,
    ) -> RetryDecision {
        if !token.is_empty() {
            if self.validate_retry_token(packet, token, remote) {
                return RetryDecision::Proceed { valid_token: true };
            }
            return RetryDecision::Drop;
        }

        if self.library.current_handshake_memory() >= self.library.retry_memory_threshold() {
            RetryDecision::Queue
        } else {
            RetryDecision::Proceed { valid_token: false }
        }
    }

    fn validate_retry_token(&self, packet: &RecvPacket, token: &[u8], remote: SocketAddr) -> bool {
        if token.len() != RETRY_TOKEN_LENGTH {
            debug!("packet dropped: invalid retry token length");
            return false;
        }
        let Some(timestamp) = RetryTokenContents::peek_timestamp(token) else {
            return false;
        };
        let Some(key) = self.library.retry_key_for_timestamp(timestamp) else {
            debug!("packet dropped: retry token key rotated out");
            return false;
        };
        let Some(contents) = RetryTokenContents::open(&key, &packet.dst_cid, token) else {
            debug!("packet dropped: retry token decryption failure");
            return false;
        };
        if contents.remote_address != remote {
            debug!("packet dropped: retry token address mismatch");
            return false;
        }
        true
    }

    /// Create a connection for the head datagram of a subchain, entering
    /// it into the remote-hash table. On a collision the existing
    /// connection is returned instead and the loser is dismantled; once
    /// the binding reference has been taken, dismantling must go through
    /// the connection's pre-allocated shutdown operation because release
    /// on the receive thread is no longer possible.
    pub(crate) fn create_connection(self: &Arc<Self>, head: &ParsedDatagram) -> Option<LookupRef> {
        let Some(src_cid) = head.packet.src_cid else {
            return None;
        };
        let tuple = head.datagram.tuple;

        let new_conn = Connection::accept(&self.library, tuple.local, tuple.remote);
        let lookup_ref = LookupRef::acquire(&new_conn);
        let mut binding_ref_added = false;

        let result = 'setup: {
            // A temporary worker carries the connection through ClientHello
            // processing; it moves to its registration's worker later.
            let worker = self.library.get_worker();
            if worker.is_overloaded() {
                debug!("packet dropped: worker overloaded");
                break 'setup None;
            }
            new_conn.assign_worker(worker);

            // The connection must be fully set up before the insert: the
            // moment it is in the table, other threads can find it.
            if !self.library.try_add_ref_binding(self) {
                debug!("packet dropped: binding clean up in progress");
                break 'setup None;
            }
            binding_ref_added = true;
            new_conn.set_binding(self.clone());

            match self
                .lookup
                .add_remote_hash(new_conn.clone(), tuple.remote, src_cid)
            {
                AddRemoteHashResult::Inserted => {
                    trace!(remote = %tuple.remote, scid = %src_cid, "connection incoming");
                    return Some(lookup_ref);
                }
                AddRemoteHashResult::Existing(existing) => {
                    // Lost a concurrent-create race; the table is the
                    // authoritative deduplicator.
                    break 'setup Some(existing);
                }
            }
        };

        // Dismantle the new connection.
        new_conn.clear_source_cids();
        drop(lookup_ref);
        if binding_ref_added {
            if new_conn.try_claim_backup_oper() {
                if let Some(worker) = new_conn.worker() {
                    worker.queue_operation(Operation::ConnShutdown {
                        conn: new_conn.clone(),
                    });
                }
            }
        } else {
            new_conn.release_ref(ConnRef::HandleOwner);
            new_conn.shutdown_silent();
        }

        result
    }

    /// Datapath unreachable callback: route the ICMP signal to whichever
    /// connection speaks with that remote.
    pub fn unreachable(&self, remote: SocketAddr) {
        if let Some(conn) = self.lookup.find_by_remote_addr(remote) {
            conn.connection().queue_unreachable(remote);
        }
    }

    //
    // Send helpers.
    //

    pub fn send_to(&self, remote: SocketAddr, ctx: SendContext) -> Result<(), DatapathError> {
        let mut remote = remote;
        if let Some(hooks) = self.library.test_hooks() {
            if hooks.send(&mut remote, None, &ctx) {
                trace!("test hook dropped send");
                return Ok(());
            }
        }
        let result = self.datapath_binding.send_to(remote, ctx);
        if let Err(e) = &result {
            warn!(%remote, "send failed: {e}");
        }
        result
    }

    pub fn send_from_to(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        ctx: SendContext,
    ) -> Result<(), DatapathError> {
        let (mut local, mut remote) = (local, remote);
        if let Some(hooks) = self.library.test_hooks() {
            if hooks.send(&mut remote, Some(&mut local), &ctx) {
                trace!("test hook dropped send");
                return Ok(());
            }
        }
        let result = self.datapath_binding.send_from_to(local, remote, ctx);
        if let Err(e) = &result {
            warn!(%remote, "send failed: {e}");
        }
        result
    }

    /// Derive the stateless reset token for a CID this binding issued.
    /// Stable for the binding's lifetime; different bindings use different
    /// salts and therefore produce unrelated tokens.
    pub fn generate_stateless_reset_token(&self, cid: &ConnectionId) -> ResetToken {
        let cid_len = self.library.config().cid_total_length as usize;
        debug_assert!(cid.len() >= cid_len);
        let tag = {
            let key = self.reset_token_hash.lock();
            hmac::sign(&key, &cid[..cid_len])
        };
        ResetToken::from_hash(tag.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn stateless_operation_count(&self) -> usize {
        self.stateless.lock().list.len()
    }

    /// Every context reachable from the list must be in the table and
    /// vice-versa.
    #[cfg(test)]
    pub(crate) fn stateless_tracker_consistent(&self) -> bool {
        let tracker = self.stateless.lock();
        tracker.table.len() == tracker.list.len()
            && tracker.list.iter().all(|ctx| {
                tracker
                    .table
                    .get(&ctx.remote_address)
                    .is_some_and(|t| Arc::ptr_eq(t, ctx))
            })
    }

    #[cfg(test)]
    pub(crate) fn listener_snapshot(&self) -> Vec<Arc<Listener>> {
        self.listeners.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn random_reserved_version(&self) -> u32 {
        self.random_reserved_version
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("local", &self.datapath_binding.local_address())
            .field("exclusive", &self.exclusive)
            .field("server_owned", &self.server_owned)
            .field("connected", &self.connected)
            .field("refs", &self.ref_count())
            .finish()
    }
}
