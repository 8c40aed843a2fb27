//! Connection lookup tables for a binding.
//!
//! Two keys index the same set of connections: locally-issued connection
//! IDs (the routing key we control) and the (remote address, source CID)
//! pair (the only stable key a server has before it issues CIDs of its
//! own). A binding starts in single-connection form and upgrades to a
//! partitioned table the moment a listener registers, since only then can
//! connection counts grow without bound.

use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};

use crate::connection::{Connection, LookupRef};
use crate::shared::ConnectionId;

/// Key of the remote-hash table
pub(crate) type RemoteHashKey = (SocketAddr, ConnectionId);

#[derive(Debug)]
pub(crate) enum AddRemoteHashResult {
    Inserted,
    /// Another connection already owns the key; returned with a lookup
    /// reference so the caller can route to it instead.
    Existing(LookupRef),
}

enum LocalCidTable {
    /// Zero or one connection; all its CIDs match by linear inspection
    Single(Option<Arc<Connection>>),
    /// CID-keyed maps, one per partition
    Partitioned(Vec<RwLock<FxHashMap<ConnectionId, Arc<Connection>>>>),
}

pub(crate) struct Lookup {
    local: RwLock<LocalCidTable>,
    remote: RwLock<FxHashMap<RemoteHashKey, Arc<Connection>>>,
}

impl Lookup {
    pub fn new() -> Self {
        Self {
            local: RwLock::new(LocalCidTable::Single(None)),
            remote: RwLock::new(FxHashMap::default()),
        }
    }

    fn partition_index(cid: &ConnectionId, count: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write(cid);
        hasher.finish() as usize % count
    }

    /// Grow to `partitions` CID tables so lookups scale with worker
    /// parallelism. Idempotent; existing registrations are rehashed.
    pub fn maximize_partitioning(&self, partitions: usize) -> bool {
        if partitions == 0 {
            return false;
        }
        let mut local = self.local.write();
        let existing = match &*local {
            LocalCidTable::Partitioned(_) => return true,
            LocalCidTable::Single(existing) => existing.clone(),
        };
        let mut tables: Vec<_> = (0..partitions)
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect();
        if let Some(conn) = existing {
            for cid in conn.source_cids() {
                let idx = Self::partition_index(&cid, partitions);
                tables[idx].get_mut().insert(cid, conn.clone());
            }
        }
        *local = LocalCidTable::Partitioned(tables);
        true
    }

    /// Register `cid` as routing to `conn`. Fails on collision with any
    /// other connection.
    pub fn add_local_cid(&self, conn: &Arc<Connection>, cid: ConnectionId) -> bool {
        loop {
            // Fast path against the partitioned form, which never reverts.
            {
                let local = self.local.read();
                if let LocalCidTable::Partitioned(tables) = &*local {
                    let idx = Self::partition_index(&cid, tables.len());
                    let mut table = tables[idx].write();
                    if table.contains_key(&cid) {
                        return false;
                    }
                    table.insert(cid, conn.clone());
                    conn.push_source_cid(cid);
                    return true;
                }
            }
            let mut local = self.local.write();
            let promote = match &mut *local {
                LocalCidTable::Single(slot @ None) => {
                    *slot = Some(conn.clone());
                    conn.push_source_cid(cid);
                    return true;
                }
                LocalCidTable::Single(Some(existing)) if Arc::ptr_eq(existing, conn) => {
                    conn.push_source_cid(cid);
                    return true;
                }
                // A second connection outgrows single form: promote under
                // the write lock, then loop to insert via the partitioned
                // path. A pre-promoted table here means we raced another
                // promotion; just retry.
                LocalCidTable::Single(Some(existing)) => Some(existing.clone()),
                LocalCidTable::Partitioned(_) => None,
            };
            if let Some(existing) = promote {
                let mut table = FxHashMap::default();
                for existing_cid in existing.source_cids() {
                    table.insert(existing_cid, existing.clone());
                }
                *local = LocalCidTable::Partitioned(vec![RwLock::new(table)]);
            }
        }
    }

    pub fn remove_local_cid(&self, conn: &Arc<Connection>, cid: &ConnectionId) {
        let mut clear_single = false;
        {
            let local = self.local.read();
            match &*local {
                LocalCidTable::Single(Some(existing)) if Arc::ptr_eq(existing, conn) => {
                    conn.forget_source_cid(cid);
                    clear_single = conn.source_cids().is_empty();
                }
                LocalCidTable::Single(_) => {}
                LocalCidTable::Partitioned(tables) => {
                    let idx = Self::partition_index(cid, tables.len());
                    tables[idx].write().remove(cid);
                    conn.forget_source_cid(cid);
                }
            }
        }
        if clear_single {
            let mut local = self.local.write();
            if let LocalCidTable::Single(slot) = &mut *local {
                if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                    *slot = None;
                }
            }
        }
    }

    /// Drop every local CID registration belonging to `conn`
    pub fn remove_local_cids(&self, conn: &Arc<Connection>) {
        for cid in conn.source_cids() {
            self.remove_local_cid(conn, &cid);
        }
    }

    /// Re-home all of `conn`'s local CIDs from `self` into `dst`, used
    /// when a connection rebinds to a different socket.
    pub fn move_local_cids(&self, dst: &Lookup, conn: &Arc<Connection>) {
        let cids = conn.source_cids();
        for cid in &cids {
            self.remove_local_cid(conn, cid);
        }
        for cid in cids {
            dst.add_local_cid(conn, cid);
        }
    }

    pub fn find_by_local_cid(&self, cid: &ConnectionId) -> Option<LookupRef> {
        let local = self.local.read();
        match &*local {
            LocalCidTable::Single(Some(conn)) if conn.has_source_cid(cid) => {
                Some(LookupRef::acquire(conn))
            }
            LocalCidTable::Single(_) => None,
            LocalCidTable::Partitioned(tables) => {
                let idx = Self::partition_index(cid, tables.len());
                tables[idx].read().get(cid).map(LookupRef::acquire)
            }
        }
    }

    /// Insert-or-find on the (remote address, source CID) key. On
    /// collision the existing connection wins and is returned referenced.
    pub fn add_remote_hash(
        &self,
        conn: Arc<Connection>,
        remote: SocketAddr,
        source_cid: ConnectionId,
    ) -> AddRemoteHashResult {
        let key = (remote, source_cid);
        let mut remote_table = self.remote.write();
        if let Some(existing) = remote_table.get(&key) {
            return AddRemoteHashResult::Existing(LookupRef::acquire(existing));
        }
        conn.set_remote_hash_key(key);
        remote_table.insert(key, conn);
        AddRemoteHashResult::Inserted
    }

    /// Remove `conn`'s remote-hash registration, if it still has one.
    /// Called both at teardown and when the handshake confirms (the CID
    /// tables take over routing at that point).
    pub fn remove_remote_hash(&self, conn: &Arc<Connection>) {
        if let Some(key) = conn.take_remote_hash_key() {
            self.remote.write().remove(&key);
        }
    }

    pub fn find_by_remote_hash(
        &self,
        remote: SocketAddr,
        source_cid: &ConnectionId,
    ) -> Option<LookupRef> {
        self.remote
            .read()
            .get(&(remote, *source_cid))
            .map(LookupRef::acquire)
    }

    /// Address-only lookup, used by the unreachable callback where no CID
    /// is available
    pub fn find_by_remote_addr(&self, remote: SocketAddr) -> Option<LookupRef> {
        if let Some(conn) = self
            .remote
            .read()
            .iter()
            .find(|((addr, _), _)| *addr == remote)
            .map(|(_, conn)| conn)
        {
            return Some(LookupRef::acquire(conn));
        }
        let local = self.local.read();
        match &*local {
            LocalCidTable::Single(Some(conn)) if conn.remote_address() == remote => {
                Some(LookupRef::acquire(conn))
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_partitioned(&self) -> bool {
        matches!(&*self.local.read(), LocalCidTable::Partitioned(_))
    }
}
