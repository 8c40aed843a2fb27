//! Process-wide state shared by every binding.
//!
//! Modeled as an injected dependency rather than a true global: bindings
//! hold an `Arc<Library>`, and tests can build as many isolated libraries
//! as they like, each with its own clock, datapath, and worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use ring::aead;

use crate::binding::Binding;
use crate::datapath::{Datapath, TestDatapathHooks};
use crate::listener::Session;
use crate::worker::{Worker, WorkerPool};

/// How long one stateless retry key generation stays current. Tokens
/// sealed under a generation that has aged out of the two-slot window no
/// longer validate.
const STATELESS_RETRY_KEY_LIFETIME_MS: u64 = 30_000;

/// Clock injection point. Production uses [`SystemTimeSource`]; tests
/// substitute a manual clock so expiration logic is deterministic.
pub trait TimeSource: Send + Sync {
    /// Monotonic milliseconds, used for aging and rate limiting
    fn now_ms(&self) -> u64;
    /// Wall-clock milliseconds since the unix epoch, used inside retry
    /// tokens
    fn epoch_ms(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemTimeSource {
    start: Instant,
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Tunables consulted by bindings
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// Length of locally-issued connection IDs
    pub cid_total_length: u8,
    /// Fraction of total memory (in 1/65535 units) the handshake budget
    /// may consume before new connections are asked to retry
    pub retry_memory_limit: u16,
    /// Memory figure the retry fraction applies to
    pub total_memory: u64,
    /// Worker threads to spawn
    pub worker_count: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            cid_total_length: 8,
            retry_memory_limit: 65, // ~0.1% of total memory
            total_memory: 1 << 30,
            worker_count: 4,
        }
    }
}

struct RetryKeySlot {
    generation: u64,
    key: Arc<aead::LessSafeKey>,
}

/// Two-generation window of stateless retry keys. Rotation is lazy: the
/// key for the current generation is created on first use, and a token
/// sealed under the previous generation still validates until it rotates
/// out of the window.
#[derive(Default)]
struct StatelessRetryKeys {
    slots: [Option<RetryKeySlot>; 2],
}

impl StatelessRetryKeys {
    fn key_for_generation(&mut self, generation: u64, create: bool) -> Option<Arc<aead::LessSafeKey>> {
        let idx = (generation % 2) as usize;
        match &self.slots[idx] {
            Some(slot) if slot.generation == generation => Some(slot.key.clone()),
            _ if create => {
                let mut material = [0u8; 32];
                StdRng::from_entropy().fill_bytes(&mut material);
                let key = Arc::new(aead::LessSafeKey::new(
                    aead::UnboundKey::new(&aead::AES_256_GCM, &material)
                        .expect("AES-256-GCM key material length"),
                ));
                self.slots[idx] = Some(RetryKeySlot {
                    generation,
                    key: key.clone(),
                });
                Some(key)
            }
            _ => None,
        }
    }
}

pub struct Library {
    config: LibraryConfig,
    datapath: Arc<dyn Datapath>,
    time: Arc<dyn TimeSource>,
    workers: WorkerPool,
    unregistered_session: Arc<Session>,
    stateless_retry_keys: Mutex<StatelessRetryKeys>,
    current_handshake_memory: AtomicU64,
    test_hooks: RwLock<Option<Arc<dyn TestDatapathHooks>>>,
}

impl Library {
    pub fn new(
        config: LibraryConfig,
        datapath: Arc<dyn Datapath>,
        time: Arc<dyn TimeSource>,
    ) -> Arc<Self> {
        let workers = WorkerPool::new(config.worker_count);
        Arc::new(Self {
            config,
            datapath,
            time,
            workers,
            unregistered_session: Arc::new(Session::default()),
            stateless_retry_keys: Mutex::new(StatelessRetryKeys::default()),
            current_handshake_memory: AtomicU64::new(0),
            test_hooks: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub(crate) fn datapath(&self) -> &Arc<dyn Datapath> {
        &self.datapath
    }

    pub(crate) fn time(&self) -> &Arc<dyn TimeSource> {
        &self.time
    }

    /// Session new server connections are initialized against before their
    /// ClientHello has been read and a listener chosen
    pub fn unregistered_session(&self) -> Arc<Session> {
        self.unregistered_session.clone()
    }

    pub(crate) fn get_worker(&self) -> Arc<Worker> {
        self.workers.get_worker()
    }

    pub(crate) fn worker_parallelism(&self) -> usize {
        self.workers.len()
    }

    /// Block until all worker queues drain
    pub fn wait_workers_idle(&self) {
        self.workers.wait_idle();
    }

    //
    // Handshake memory budget, consulted for the retry decision.
    //

    pub fn current_handshake_memory(&self) -> u64 {
        self.current_handshake_memory.load(Ordering::Relaxed)
    }

    pub fn set_handshake_memory(&self, value: u64) {
        self.current_handshake_memory.store(value, Ordering::Relaxed);
    }

    pub(crate) fn add_handshake_memory(&self, delta: u64) {
        self.current_handshake_memory
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn sub_handshake_memory(&self, delta: u64) {
        let prev = self.current_handshake_memory.fetch_sub(delta, Ordering::Relaxed);
        debug_assert!(prev >= delta);
    }

    /// Handshake-memory level at or above which connections without a
    /// validated token are asked to retry
    pub(crate) fn retry_memory_threshold(&self) -> u64 {
        (u64::from(self.config.retry_memory_limit) * self.config.total_memory)
            / u64::from(u16::MAX)
    }

    //
    // Stateless retry keys.
    //

    fn retry_key_generation(&self, epoch_ms: u64) -> u64 {
        epoch_ms / STATELESS_RETRY_KEY_LIFETIME_MS
    }

    /// Key for sealing a fresh retry token
    pub(crate) fn current_retry_key(&self) -> Arc<aead::LessSafeKey> {
        let generation = self.retry_key_generation(self.time.epoch_ms());
        self.stateless_retry_keys
            .lock()
            .key_for_generation(generation, true)
            .expect("current generation is always creatable")
    }

    /// Key for validating a token issued at `timestamp_ms`, if that
    /// generation is still within the rotation window
    pub(crate) fn retry_key_for_timestamp(&self, timestamp_ms: u64) -> Option<Arc<aead::LessSafeKey>> {
        let current = self.retry_key_generation(self.time.epoch_ms());
        let issued = self.retry_key_generation(timestamp_ms);
        if issued != current && issued + 1 != current {
            return None;
        }
        self.stateless_retry_keys
            .lock()
            .key_for_generation(issued, false)
    }

    //
    // Test datapath hooks.
    //

    pub fn set_test_hooks(&self, hooks: Option<Arc<dyn TestDatapathHooks>>) {
        *self.test_hooks.write() = hooks;
    }

    pub(crate) fn test_hooks(&self) -> Option<Arc<dyn TestDatapathHooks>> {
        self.test_hooks.read().clone()
    }

    //
    // Binding reference management. The counted reference is what keeps a
    // binding alive across threads; when the last one goes, the binding is
    // torn down on the releasing thread.
    //

    /// Take a counted reference unless teardown already began
    pub(crate) fn try_add_ref_binding(&self, binding: &Binding) -> bool {
        binding.try_add_ref()
    }

    /// Drop a counted reference; the last release uninitializes the
    /// binding.
    pub fn release_binding(&self, binding: &Arc<Binding>) {
        if binding.release_ref() {
            binding.uninitialize();
        }
    }
}
