//! Worker threads and their operation queues.
//!
//! The receive path never blocks, so anything that may take time (crypto,
//! stateless responses, connection teardown) is expressed as a tagged
//! operation and handed to a worker. Each worker is a plain thread
//! draining an MPSC channel; a connection is always served by exactly one
//! worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::binding::{StatelessContext, StatelessOperationType};
use crate::connection::Connection;

/// Queue depth beyond which a worker refuses new stateless work and new
/// connections
const OPERATION_QUEUE_OVERLOAD_THRESHOLD: usize = 256;

pub(crate) enum Operation {
    Stateless {
        ty: StatelessOperationType,
        ctx: Arc<StatelessContext>,
    },
    ConnRecv {
        conn: Arc<Connection>,
    },
    ConnShutdown {
        conn: Arc<Connection>,
    },
    Shutdown,
}

pub(crate) struct Worker {
    id: usize,
    tx: Sender<Operation>,
    queued: AtomicUsize,
}

impl Worker {
    /// Queue depth based overload check, consulted before any new work is
    /// committed to this worker.
    pub fn is_overloaded(&self) -> bool {
        self.queued.load(Ordering::Relaxed) >= OPERATION_QUEUE_OVERLOAD_THRESHOLD
    }

    pub fn queue_operation(&self, op: Operation) -> bool {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(op).is_err() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn run(self: &Arc<Self>, rx: Receiver<Operation>) {
        while let Ok(op) = rx.recv() {
            match op {
                Operation::Stateless { ty, ctx } => {
                    ctx.binding().process_stateless_operation(ty, &ctx);
                    ctx.binding().release_stateless_operation(&ctx, true);
                }
                Operation::ConnRecv { conn } => {
                    conn.process_recv();
                }
                Operation::ConnShutdown { conn } => {
                    conn.shutdown_silent();
                }
                Operation::Shutdown => {
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    break;
                }
            }
            self.queued.fetch_sub(1, Ordering::Relaxed);
        }
        trace!(worker = self.id, "worker stopped");
    }
}

pub(crate) struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    next: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(count: usize) -> Self {
        assert!(count > 0);
        let mut workers = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, rx) = unbounded();
            let worker = Arc::new(Worker {
                id,
                tx,
                queued: AtomicUsize::new(0),
            });
            let runner = worker.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("quicbind-worker-{id}"))
                    .spawn(move || runner.run(rx))
                    .expect("spawn worker thread"),
            );
            workers.push(worker);
        }
        Self {
            workers,
            next: AtomicUsize::new(0),
            threads: Mutex::new(threads),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Round-robin worker selection
    pub fn get_worker(&self) -> Arc<Worker> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].clone()
    }

    /// Block until every worker queue is empty. Useful before teardown and
    /// in tests that need queued operations to have run.
    pub fn wait_idle(&self) {
        loop {
            if self
                .workers
                .iter()
                .all(|w| w.queued.load(Ordering::Relaxed) == 0)
            {
                return;
            }
            thread::yield_now();
        }
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            // Ignore failure: the channel is already closed on re-entry.
            let _ = worker.queue_operation(Operation::Shutdown);
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
