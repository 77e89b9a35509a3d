//! The external authentication manager.
//!
//! One worker thread services a FIFO of authentication/authorization tasks
//! against a single provider connection (the head of the registered list).
//! Requests become server-initiated frames on the provider's stream; the
//! provider echoes each frame's opaque in its response.
//!
//! Lock ordering is load-bearing here: the manager mutex sits strictly below
//! any connection's worker-thread mutex, so the worker always releases its
//! own lock before delivering frames or results, then re-acquires it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kelpie_protocol::{Response, Status};

use crate::connection::Connection;
use crate::rbac::{epoch_millis, RbacCache};
use crate::settings::Settings;

use super::events;
use super::task::{AuthRequest, AuthTask};
use super::users::ActiveUsers;

/// Canonical payload delivered to every task whose provider went away (or
/// never existed).
pub const PROVIDER_DOWN_PAYLOAD: &str =
    r#"{"error":{"context":"External auth service is down"}}"#;

struct QueuedResponse {
    opaque: u32,
    status: Status,
    payload: String,
}

struct Inner {
    running: bool,
    /// Registered providers; the head is "the provider".
    connections: Vec<Arc<Connection>>,
    pending_remove: Vec<Arc<Connection>>,
    incoming_requests: VecDeque<Arc<AuthTask>>,
    incoming_responses: VecDeque<QueuedResponse>,
    /// Opaque -> (owning provider, task). The provider slot drops to `None`
    /// once that provider is torn down.
    request_map: HashMap<u32, (Option<Arc<Connection>>, Arc<AuthTask>)>,
    next_opaque: u32,
    last_push: Instant,
}

pub struct ExternalAuthManager {
    inner: Mutex<Inner>,
    cv: Condvar,
    rbac: Arc<RbacCache>,
    active_users: ActiveUsers,
    push_interval_ms: AtomicU64,
    /// Cached RBAC entries refreshed before this epoch are stale and force a
    /// full authorization round trip.
    rbac_cache_epoch: AtomicU64,
}

impl ExternalAuthManager {
    pub fn new(rbac: Arc<RbacCache>, settings: &Settings) -> Arc<ExternalAuthManager> {
        Arc::new(ExternalAuthManager {
            inner: Mutex::new(Inner {
                running: true,
                connections: Vec::new(),
                pending_remove: Vec::new(),
                incoming_requests: VecDeque::new(),
                incoming_responses: VecDeque::new(),
                request_map: HashMap::new(),
                next_opaque: 0,
                last_push: Instant::now(),
            }),
            cv: Condvar::new(),
            rbac,
            active_users: ActiveUsers::new(),
            push_interval_ms: AtomicU64::new(
                settings.active_users_push_interval.as_millis() as u64
            ),
            rbac_cache_epoch: AtomicU64::new(0),
        })
    }

    /// Spawn the worker thread. Call once; join the handle after `shutdown`.
    pub fn start(self: &Arc<ExternalAuthManager>) -> JoinHandle<()> {
        let manager = self.clone();
        thread::Builder::new()
            .name("external-auth".to_string())
            .spawn(move || manager.run())
            .expect("spawn external auth thread")
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        self.cv.notify_all();
    }

    /// Register a provider connection. The first registered becomes the
    /// provider all traffic flows through.
    pub fn add_provider(&self, connection: Arc<Connection>) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.push(connection);
    }

    /// Schedule a provider for teardown. Its in-flight tasks fail on the
    /// worker thread with the canonical provider-down payload.
    pub fn remove_provider(&self, connection: &Arc<Connection>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner
            .connections
            .iter()
            .position(|c| Arc::ptr_eq(c, connection))
        {
            let conn = inner.connections.remove(pos);
            inner.pending_remove.push(conn);
            self.cv.notify_all();
        }
    }

    /// Queue a task for the provider. The caller parks on `task.wait()`.
    pub fn enqueue_request(&self, task: Arc<AuthTask>) {
        let mut inner = self.inner.lock().unwrap();
        inner.incoming_requests.push_back(task);
        self.cv.notify_all();
    }

    /// Called from the provider connection's reader with a decoded response
    /// frame. A successful payload carrying an `"rbac"` object refreshes the
    /// RBAC cache here, before the waiting task can observe the response.
    pub fn response_received(&self, response: &Response) {
        if response.status.is_success() && !response.value.is_empty() {
            match serde_json::from_slice::<serde_json::Value>(&response.value) {
                Ok(decoded) => {
                    if let Some(rbac) = decoded.get("rbac") {
                        self.rbac.update_external_user(rbac);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        opaque = response.opaque,
                        "malformed payload in successful auth response"
                    );
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.incoming_responses.push_back(QueuedResponse {
            opaque: response.opaque,
            status: response.status,
            payload: String::from_utf8_lossy(&response.value).into_owned(),
        });
        self.cv.notify_all();
    }

    pub fn login(&self, user: &str) {
        self.active_users.login(user);
    }

    pub fn logoff(&self, user: &str) {
        self.active_users.logoff(user);
    }

    pub fn active_users(&self) -> serde_json::Value {
        self.active_users.to_json()
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms.load(Ordering::Acquire))
    }

    pub fn set_push_interval(&self, interval: Duration) {
        self.push_interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
    }

    /// Invalidate RBAC entries cached before `at`.
    pub fn set_rbac_cache_epoch(&self, at: Instant) {
        self.rbac_cache_epoch
            .store(epoch_millis(at), Ordering::Release);
    }

    /// Is the cached RBAC entry for `user` fresh enough to skip a full
    /// authorization exchange during authentication?
    fn have_rbac_entry_for(&self, user: &str) -> bool {
        let Some(timestamp) = self.rbac.external_user_timestamp(user) else {
            return false;
        };
        let stale_before = Instant::now()
            .checked_sub(2 * self.push_interval())
            .unwrap_or_else(Instant::now);
        timestamp > stale_before
            && epoch_millis(timestamp) >= self.rbac_cache_epoch.load(Ordering::Acquire)
    }

    fn run(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.last_push = Instant::now();
        while guard.running {
            if guard.incoming_requests.is_empty()
                && guard.incoming_responses.is_empty()
                && guard.pending_remove.is_empty()
            {
                // Sleep until woken, or until the next active-users push is
                // due.
                let interval = self.push_interval();
                let elapsed = guard.last_push.elapsed();
                let sleep = interval.saturating_sub(elapsed);
                let (g, _) = self.cv.wait_timeout(guard, sleep).unwrap();
                guard = g;
                if !guard.running {
                    return;
                }
            }

            guard = self.purge_pending_dead_connections(guard);
            guard = self.process_request_queue(guard);
            guard = self.process_response_queue(guard);

            if guard.last_push.elapsed() >= self.push_interval() {
                guard = self.push_active_users(guard);
                guard.last_push = Instant::now();
            }
        }
    }

    fn purge_pending_dead_connections<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner>,
    ) -> MutexGuard<'a, Inner> {
        let pending = std::mem::take(&mut guard.pending_remove);
        for provider in pending {
            tracing::warn!(
                provider = provider.description(),
                "external authentication provider died, expect authentication failures"
            );
            let mut orphaned = Vec::new();
            for (opaque, entry) in guard.request_map.iter_mut() {
                let owned = entry.0.as_ref().is_some_and(|c| Arc::ptr_eq(c, &provider));
                if owned {
                    orphaned.push(*opaque);
                    entry.0 = None;
                }
            }
            for opaque in orphaned {
                guard.incoming_responses.push_back(QueuedResponse {
                    opaque,
                    status: Status::Etmpfail,
                    payload: PROVIDER_DOWN_PAYLOAD.to_string(),
                });
            }

            // Wake the provider's owning thread so it can finish teardown;
            // our reference drops when `provider` leaves scope.
            drop(guard);
            provider.signal_if_idle();
            guard = self.inner.lock().unwrap();
        }
        guard
    }

    fn process_request_queue<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner>,
    ) -> MutexGuard<'a, Inner> {
        if guard.connections.is_empty() {
            // No provider: fail each request immediately through the normal
            // response path.
            while let Some(task) = guard.incoming_requests.pop_front() {
                let opaque = guard.next_opaque;
                guard.next_opaque = guard.next_opaque.wrapping_add(1);
                guard.incoming_responses.push_back(QueuedResponse {
                    opaque,
                    status: Status::Etmpfail,
                    payload: PROVIDER_DOWN_PAYLOAD.to_string(),
                });
                guard.request_map.insert(opaque, (None, task));
            }
            return guard;
        }

        let provider = guard.connections[0].clone();

        // Build every frame before touching the provider's thread so it is
        // locked once, briefly.
        let mut frames = Vec::new();
        while let Some(task) = guard.incoming_requests.pop_front() {
            let opaque = guard.next_opaque;
            guard.next_opaque = guard.next_opaque.wrapping_add(1);
            let frame = match task.request() {
                AuthRequest::Authenticate {
                    username,
                    mechanism,
                    challenge,
                } => events::authenticate_frame(
                    opaque,
                    mechanism,
                    challenge,
                    self.have_rbac_entry_for(username),
                ),
                AuthRequest::GetAuthorization { username } => {
                    events::get_authorization_frame(opaque, username)
                }
            };
            frames.push(frame);
            guard
                .request_map
                .insert(opaque, (Some(provider.clone()), task));
        }

        if !frames.is_empty() {
            drop(guard);
            provider.enqueue_frames(frames);
            guard = self.inner.lock().unwrap();
        }
        guard
    }

    fn process_response_queue<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Inner>,
    ) -> MutexGuard<'a, Inner> {
        let mut responses = std::mem::take(&mut guard.incoming_responses);
        while let Some(response) = responses.pop_front() {
            match guard.request_map.remove(&response.opaque) {
                Some((_provider, task)) => {
                    drop(guard);
                    task.complete(response.status, response.payload);
                    guard = self.inner.lock().unwrap();
                }
                None => {
                    // The task's provider died before this response arrived.
                    tracing::warn!(opaque = response.opaque, "ignoring unknown opaque");
                }
            }
        }
        guard
    }

    fn push_active_users<'a>(
        &'a self,
        guard: MutexGuard<'a, Inner>,
    ) -> MutexGuard<'a, Inner> {
        if guard.connections.is_empty() {
            return guard;
        }
        let provider = guard.connections[0].clone();
        let payload = self.active_users.to_json().to_string();
        drop(guard);
        provider.enqueue_frames([events::active_users_frame(&payload)]);
        self.inner.lock().unwrap()
    }
}
