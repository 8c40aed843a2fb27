//! Rundown protection: many readers take short-lived references, one
//! writer eventually forbids new references and waits for the rest to
//! drain. Cheaper than reference counting the protected object itself
//! when teardown is rare and reads are hot.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    active: usize,
    shutting_down: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Rundown {
    state: Mutex<State>,
    drained: Condvar,
}

impl Rundown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference. Fails once `shutdown` has begun.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down {
            return false;
        }
        state.active += 1;
        true
    }

    /// Drop a reference taken with `acquire`
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.active > 0);
        state.active -= 1;
        if state.active == 0 {
            self.drained.notify_all();
        }
    }

    /// Forbid new references and block until all current holders release.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        while state.active > 0 {
            self.drained.wait(&mut state);
        }
    }
}
