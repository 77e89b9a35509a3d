//! Connections and the worker threads that own them.
//!
//! Every connection belongs to one I/O worker thread; enqueueing outbound
//! frames requires that thread's lock. The auth manager's lock sits strictly
//! below any worker-thread lock, so deliveries always happen with the
//! manager lock released.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Debug, Default)]
struct ThreadState {
    outbound: VecDeque<Bytes>,
}

/// Stand-in for a connection's owning I/O thread: a locked outbound queue
/// plus the condition variable the thread sleeps on.
#[derive(Debug)]
pub struct WorkerThread {
    name: String,
    state: Mutex<ThreadState>,
    cv: Condvar,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>) -> Arc<WorkerThread> {
        Arc::new(WorkerThread {
            name: name.into(),
            state: Mutex::new(ThreadState::default()),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, frames: impl IntoIterator<Item = Bytes>) {
        let mut state = self.state.lock().unwrap();
        state.outbound.extend(frames);
        self.cv.notify_all();
    }

    /// Wake the thread without queueing anything (shutdown progress nudges).
    pub fn signal(&self) {
        let _state = self.state.lock().unwrap();
        self.cv.notify_all();
    }

    /// Take everything currently queued.
    pub fn drain_outbound(&self) -> Vec<Bytes> {
        let mut state = self.state.lock().unwrap();
        state.outbound.drain(..).collect()
    }

    /// Block until at least `count` frames are queued or the deadline hits,
    /// then take them all.
    pub fn wait_outbound(&self, count: usize, timeout: Duration) -> Vec<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.outbound.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        state.outbound.drain(..).collect()
    }
}

/// A client or provider connection. Shared (`Arc`) so it outlives any
/// in-flight task that references it.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    description: String,
    thread: Arc<WorkerThread>,
}

impl Connection {
    pub fn new(id: u64, description: impl Into<String>, thread: Arc<WorkerThread>) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            description: description.into(),
            thread,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn thread(&self) -> &Arc<WorkerThread> {
        &self.thread
    }

    /// Queue frames onto the owning thread's outbound stream and signal it.
    /// Takes the thread lock internally; callers must not hold locks that
    /// order above it.
    pub fn enqueue_frames(&self, frames: impl IntoIterator<Item = Bytes>) {
        self.thread.enqueue(frames);
    }

    /// Wake the owning thread so it can observe state changes (teardown).
    pub fn signal_if_idle(&self) {
        self.thread.signal();
    }
}
