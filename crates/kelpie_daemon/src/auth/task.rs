//! Suspended authentication/authorization work.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use kelpie_protocol::Status;

use crate::connection::Connection;

/// What the manager asks the provider to do on a task's behalf.
#[derive(Clone, Debug)]
pub enum AuthRequest {
    Authenticate {
        username: String,
        mechanism: String,
        challenge: Vec<u8>,
    },
    GetAuthorization {
        username: String,
    },
}

impl AuthRequest {
    pub fn username(&self) -> &str {
        match self {
            AuthRequest::Authenticate { username, .. } => username,
            AuthRequest::GetAuthorization { username } => username,
        }
    }
}

/// Terminal result of a task. Provider teardown surfaces here with the same
/// payload shape as any other failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthResult {
    pub status: Status,
    pub payload: String,
}

/// One in-flight request. The issuing connection parks on `wait` after
/// enqueueing; the manager thread delivers the result exactly once and
/// signals the origin's worker thread.
pub struct AuthTask {
    request: AuthRequest,
    origin: Arc<Connection>,
    slot: Mutex<Option<AuthResult>>,
    cv: Condvar,
}

impl AuthTask {
    pub fn new(request: AuthRequest, origin: Arc<Connection>) -> Arc<AuthTask> {
        Arc::new(AuthTask {
            request,
            origin,
            slot: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    pub fn origin(&self) -> &Arc<Connection> {
        &self.origin
    }

    /// Deliver the result. Called from the manager thread with no manager
    /// lock held; delivering twice is a programming error.
    pub fn complete(&self, status: Status, payload: String) {
        {
            let mut slot = self.slot.lock().unwrap();
            assert!(
                slot.is_none(),
                "auth task completed twice (second status {status:?})"
            );
            *slot = Some(AuthResult { status, payload });
            self.cv.notify_all();
        }
        self.origin.signal_if_idle();
    }

    /// Park until the result arrives.
    pub fn wait(&self) -> AuthResult {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.cv.wait(slot).unwrap();
        }
    }

    /// Park with a deadline; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<AuthResult> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::WorkerThread;

    #[test]
    fn wait_returns_delivered_result() {
        let thread = WorkerThread::new("client-0");
        let conn = Connection::new(1, "[client]", thread);
        let task = AuthTask::new(
            AuthRequest::GetAuthorization {
                username: "joe".into(),
            },
            conn,
        );
        let waiter = {
            let task = task.clone();
            std::thread::spawn(move || task.wait())
        };
        task.complete(Status::Success, "{}".into());
        let result = waiter.join().unwrap();
        assert_eq!(result.status, Status::Success);
    }

    #[test]
    fn wait_timeout_expires_without_result() {
        let thread = WorkerThread::new("client-1");
        let conn = Connection::new(2, "[client]", thread);
        let task = AuthTask::new(
            AuthRequest::GetAuthorization {
                username: "joe".into(),
            },
            conn,
        );
        assert!(task.wait_timeout(Duration::from_millis(10)).is_none());
    }
}
