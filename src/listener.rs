//! Listeners: the accept surface a binding consults for new connections.
//!
//! The binding only needs a narrow view of a listener: where it listens,
//! which ALPNs its session speaks, and a rundown guard so a listener being
//! torn down is never handed a new connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::rundown::Rundown;

/// Session state a listener accepts connections into. The binding only
/// consults its ALPN set.
#[derive(Debug, Clone, Default)]
pub struct Session {
    alpns: Vec<Vec<u8>>,
}

impl Session {
    pub fn new<I, A>(alpns: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self {
            alpns: alpns.into_iter().map(|a| a.as_ref().to_vec()).collect(),
        }
    }

    /// Whether any ALPN is offered by both sessions
    pub fn has_alpn_overlap(&self, other: &Self) -> bool {
        self.alpns.iter().any(|a| other.alpns.contains(a))
    }

    /// Whether this session speaks any ALPN the client offered
    pub fn matches_alpn(&self, info: &NewConnectionInfo) -> bool {
        info.client_alpns.iter().any(|a| self.alpns.contains(a))
    }
}

/// Connection attributes extracted from a ClientHello, used to pick the
/// accepting listener
#[derive(Debug, Clone)]
pub struct NewConnectionInfo {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub client_alpns: Vec<Vec<u8>>,
    pub server_name: Option<String>,
}

#[derive(Debug)]
pub struct Listener {
    /// `None` makes the listener family-agnostic: it matches any local
    /// address on the binding.
    local_address: Option<SocketAddr>,
    wildcard: bool,
    session: Session,
    pub(crate) rundown: Rundown,
}

/// Ranking used to keep a binding's listener list sorted family-first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum FamilyRank {
    Unspecified = 0,
    V4 = 1,
    V6 = 2,
}

pub(crate) fn family_rank_of(addr: &SocketAddr) -> FamilyRank {
    if addr.is_ipv4() {
        FamilyRank::V4
    } else {
        FamilyRank::V6
    }
}

impl Listener {
    pub fn new(session: Session, local_address: Option<SocketAddr>) -> Arc<Self> {
        let wildcard = local_address.map_or(true, |addr| addr.ip().is_unspecified());
        Arc::new(Self {
            local_address,
            wildcard,
            session,
            rundown: Rundown::new(),
        })
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn family_rank(&self) -> FamilyRank {
        match self.local_address {
            None => FamilyRank::Unspecified,
            Some(addr) if addr.is_ipv4() => FamilyRank::V4,
            Some(_) => FamilyRank::V6,
        }
    }

    /// IP equality against a requested local address; ports are owned by
    /// the binding and do not participate.
    pub(crate) fn ip_matches(&self, addr: &SocketAddr) -> bool {
        self.local_address
            .map_or(false, |own| own.ip() == addr.ip())
    }

    /// IP equality between two listeners of the same address family
    pub(crate) fn same_ip(&self, other: &Listener) -> bool {
        match (self.local_address, other.local_address) {
            (Some(a), Some(b)) => a.ip() == b.ip(),
            _ => false,
        }
    }

    /// Wait out all in-flight uses and permanently stop matching. Must be
    /// called before the listener is unregistered and dropped.
    pub fn shutdown(&self) {
        self.rundown.shutdown();
    }
}

/// A matched listener, held alive against teardown for as long as the
/// reference exists
#[derive(Debug)]
pub struct ListenerRef {
    listener: Arc<Listener>,
}

impl ListenerRef {
    pub(crate) fn acquire(listener: &Arc<Listener>) -> Option<Self> {
        listener.rundown.acquire().then(|| Self {
            listener: listener.clone(),
        })
    }
}

impl std::ops::Deref for ListenerRef {
    type Target = Listener;
    fn deref(&self) -> &Listener {
        &self.listener
    }
}

impl Drop for ListenerRef {
    fn drop(&mut self) {
        self.listener.rundown.release();
    }
}
