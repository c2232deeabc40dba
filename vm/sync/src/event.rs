use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A bounded-timeout safety net applied to every wait on a [`ManualResetEvent`].
///
/// No thread may block indefinitely on a condition whose signaler could itself be
/// quiescent; every waiter re-checks its condition on this cadence even if nobody
/// signals it.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

struct State {
    signaled: bool,
    generation: u64,
}

/// A manual-reset event: once [`set`](Self::set), it stays signaled for every
/// waiter until explicitly [`reset`](Self::reset).
///
/// Used for the page-list "new pages available" events, the trim low-water
/// wake event, the modified-writer wake event, the scratch-VA pool's
/// "item available" event, and the termination event. Backed by a
/// [`Condvar`] rather than an OS kernel event object, since this manager
/// runs as ordinary user-space threads rather than inside a scheduler.
pub struct ManualResetEvent {
    state: Mutex<State>,
    cv: Condvar,
}

impl ManualResetEvent {
    pub fn new(initially_signaled: bool) -> Self {
        Self {
            state: Mutex::new(State {
                signaled: initially_signaled,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        state.signaled = true;
        state.generation = state.generation.wrapping_add(1);
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        self.state.lock().unwrap().signaled = false;
    }

    /// Sets then immediately resets the event, waking every thread currently
    /// blocked in [`wait`](Self::wait) without leaving the event signaled for
    /// future waiters. Used to wake the modified writer and the ager/trimmer
    /// without the event remaining permanently signaled.
    pub fn pulse(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation = state.generation.wrapping_add(1);
        self.cv.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().unwrap().signaled
    }

    /// Blocks until the event is signaled or pulsed, whichever comes first,
    /// bounded by [`DEFAULT_WAIT_TIMEOUT`] as a liveness safety net.
    pub fn wait_timeout(&self) {
        let state = self.state.lock().unwrap();
        if state.signaled {
            return;
        }
        let generation = state.generation;
        let _ = self
            .cv
            .wait_timeout_while(state, DEFAULT_WAIT_TIMEOUT, |state| {
                !state.signaled && state.generation == generation
            })
            .unwrap();
    }
}

/// Waits on whichever of several events becomes signaled or pulsed first,
/// bounded by [`DEFAULT_WAIT_TIMEOUT`]. Mirrors a `WaitForMultipleObjects`
/// call with `wait_all = FALSE`.
pub fn wait_any(events: &[&ManualResetEvent]) {
    if let Some(first) = events.iter().find(|e| e.is_signaled()) {
        let _ = first;
        return;
    }
    // No single condvar spans multiple independent mutexes; since every
    // caller of `wait_any` is in a bounded retry loop anyway (the fault
    // handler re-verifies list counts under their own locks before
    // blocking), a short sleep bounded by the same timeout is sufficient
    // and keeps the locking discipline of each event independent.
    std::thread::sleep(Duration::from_millis(1));
    for event in events {
        event.wait_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn set_wakes_waiter_immediately() {
        let event = Arc::new(ManualResetEvent::new(false));
        let waiter_event = event.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || {
            waiter_event.wait_timeout();
        });
        thread::sleep(Duration::from_millis(5));
        event.set();
        handle.join().unwrap();
        assert!(start.elapsed() < DEFAULT_WAIT_TIMEOUT * 3);
    }

    #[test]
    fn pulse_does_not_latch() {
        let event = ManualResetEvent::new(false);
        event.pulse();
        assert!(!event.is_signaled());
    }

    #[test]
    fn timeout_fires_without_signal() {
        let event = ManualResetEvent::new(false);
        let start = Instant::now();
        event.wait_timeout();
        assert!(start.elapsed() >= DEFAULT_WAIT_TIMEOUT);
    }
}
