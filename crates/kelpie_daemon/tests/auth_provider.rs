//! External auth manager scenarios against a fake provider connection.
//!
//! Test flow:
//! 1) Start the manager's worker thread with a recording RBAC cache.
//! 2) Register a provider connection backed by an in-process worker-thread
//!    mailbox and drive requests from real client threads.
//! 3) Parse the frames the provider receives, inject responses, and assert
//!    task outcomes, cache effects and teardown behavior.
//!
//! Failure model covered:
//! - provider disconnect with tasks in flight (canonical error payload,
//!   refcount release);
//! - requests arriving with no provider registered;
//! - responses with unknown opaques.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kelpie_daemon::auth::{AuthRequest, AuthTask, ExternalAuthManager};
use kelpie_daemon::connection::{Connection, WorkerThread};
use kelpie_daemon::rbac::RbacCache;
use kelpie_daemon::settings::Settings;
use kelpie_protocol::{Magic, Request, Response, ServerOpcode, Status};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

const PROVIDER_DOWN: &str = r#"{"error":{"context":"External auth service is down"}}"#;

struct Harness {
    manager: Arc<ExternalAuthManager>,
    rbac: Arc<RbacCache>,
    worker: thread::JoinHandle<()>,
}

impl Harness {
    fn start(settings: Settings) -> Harness {
        let rbac = Arc::new(RbacCache::new());
        let manager = ExternalAuthManager::new(rbac.clone(), &settings);
        let worker = manager.start();
        Harness {
            manager,
            rbac,
            worker,
        }
    }

    fn stop(self) {
        self.manager.shutdown();
        self.worker.join().unwrap();
    }
}

fn provider(id: u64) -> (Arc<Connection>, Arc<WorkerThread>) {
    let thread = WorkerThread::new(format!("auth-provider-{id}"));
    let conn = Connection::new(id, "[provider - local]", thread.clone());
    (conn, thread)
}

fn client_task(id: u64, username: &str) -> Arc<AuthTask> {
    let thread = WorkerThread::new(format!("client-{id}"));
    let conn = Connection::new(id, "[client - local]", thread);
    AuthTask::new(
        AuthRequest::Authenticate {
            username: username.into(),
            mechanism: "PLAIN".into(),
            challenge: format!("challenge-{id}").into_bytes(),
        },
        conn,
    )
}

fn response_frame(request: &Request, status: Status, payload: &str) -> Response {
    // Provider responses echo the request opaque.
    let mut buf = vec![0u8; kelpie_protocol::HEADER_LEN];
    buf[0] = Magic::ServerResponse as u8;
    buf[1] = request.opcode;
    buf[6..8].copy_from_slice(&status.code().to_be_bytes());
    buf[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    buf[12..16].copy_from_slice(&request.opaque.to_be_bytes());
    buf.extend_from_slice(payload.as_bytes());
    Response::parse(&buf).unwrap()
}

#[test]
fn requests_flow_to_the_provider_and_back() {
    let harness = Harness::start(Settings::default());
    let (conn, thread) = provider(100);
    harness.manager.add_provider(conn.clone());

    let task = client_task(1, "joe");
    harness.manager.enqueue_request(task.clone());

    let frames = thread.wait_outbound(1, IO_TIMEOUT);
    assert_eq!(frames.len(), 1);
    let request = Request::parse(&frames[0]).unwrap();
    assert_eq!(request.opcode, ServerOpcode::Authenticate as u8);
    let body: serde_json::Value = serde_json::from_slice(&request.value).unwrap();
    assert_eq!(body["mechanism"], "PLAIN");
    // No cached RBAC entry yet, so a full exchange is requested.
    assert_eq!(body["authentication-only"], false);

    let payload = r#"{"rbac":{"joe":{"buckets":{"default":["Read"]}}}}"#;
    harness
        .manager
        .response_received(&response_frame(&request, Status::Success, payload));

    let result = task.wait_timeout(IO_TIMEOUT).expect("task resolved");
    assert_eq!(result.status, Status::Success);
    // The cache was refreshed before the task could observe the response.
    assert!(harness.rbac.lookup("joe").is_some());

    harness.stop();
}

#[test]
fn provider_disconnect_fails_all_inflight_tasks() {
    let harness = Harness::start(Settings::default());
    let (conn, thread) = provider(200);
    harness.manager.add_provider(conn.clone());

    let task_a = client_task(1, "anne");
    let task_b = client_task(2, "bob");
    harness.manager.enqueue_request(task_a.clone());
    harness.manager.enqueue_request(task_b.clone());

    // Both requests reached the provider; nobody answers.
    let frames = thread.wait_outbound(2, IO_TIMEOUT);
    assert_eq!(frames.len(), 2);
    let opaque_a = Request::parse(&frames[0]).unwrap().opaque;
    let opaque_b = Request::parse(&frames[1]).unwrap().opaque;
    assert_ne!(opaque_a, opaque_b);

    harness.manager.remove_provider(&conn);

    for task in [&task_a, &task_b] {
        let result = task.wait_timeout(IO_TIMEOUT).expect("task failed over");
        assert_eq!(result.status, Status::Etmpfail);
        assert_eq!(result.payload, PROVIDER_DOWN);
    }

    // The manager dropped its references; only the test and the connection's
    // own handle remain.
    for _ in 0..100 {
        if Arc::strong_count(&conn) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(Arc::strong_count(&conn), 1);

    // A late response for a torn-down task is ignored, not fatal.
    let stale = Request::parse(&frames[0]).unwrap();
    harness
        .manager
        .response_received(&response_frame(&stale, Status::Success, "{}"));

    // With no provider, new requests fail immediately.
    let task_c = client_task(3, "carol");
    harness.manager.enqueue_request(task_c.clone());
    let result = task_c.wait_timeout(IO_TIMEOUT).expect("immediate failure");
    assert_eq!(result.status, Status::Etmpfail);
    assert_eq!(result.payload, PROVIDER_DOWN);

    harness.stop();
}

#[test]
fn concurrent_clients_each_get_their_own_answer() {
    let harness = Harness::start(Settings::default());
    let (conn, thread) = provider(300);
    harness.manager.add_provider(conn);

    let mut waiters = Vec::new();
    for id in 0..8 {
        let task = client_task(id, &format!("user-{id}"));
        harness.manager.enqueue_request(task.clone());
        waiters.push(thread::spawn(move || task.wait()));
    }

    // Answer each request as it surfaces, slowest-first to force the
    // manager through its release/re-acquire cycle repeatedly.
    let mut answered = 0;
    while answered < 8 {
        for frame in thread.wait_outbound(1, IO_TIMEOUT) {
            let request = Request::parse(&frame).unwrap();
            let payload = format!(r#"{{"opaque":{}}}"#, request.opaque);
            harness
                .manager
                .response_received(&response_frame(&request, Status::Success, &payload));
            answered += 1;
        }
    }

    for waiter in waiters {
        let result = waiter.join().unwrap();
        assert_eq!(result.status, Status::Success);
    }

    harness.stop();
}

#[test]
fn active_users_are_pushed_on_the_interval() {
    let harness = Harness::start(Settings {
        active_users_push_interval: Duration::from_millis(50),
    });
    // Log the users in before the provider registers so the first push
    // already carries them.
    harness.manager.login("anne");
    harness.manager.login("joe");
    harness.manager.login("joe");
    harness.manager.logoff("joe");

    let (conn, thread) = provider(400);
    harness.manager.add_provider(conn);

    let frames = thread.wait_outbound(1, IO_TIMEOUT);
    assert!(!frames.is_empty());
    let request = Request::parse(&frames[0]).unwrap();
    assert_eq!(request.opcode, ServerOpcode::ActiveExternalUsers as u8);
    let users: serde_json::Value = serde_json::from_slice(&request.value).unwrap();
    assert_eq!(users, serde_json::json!(["anne", "joe"]));

    harness.stop();
}

#[test]
fn warm_rbac_cache_requests_authentication_only() {
    let harness = Harness::start(Settings::default());
    let (conn, thread) = provider(500);
    harness.manager.add_provider(conn);

    // First exchange populates the cache for the user.
    let first = client_task(1, "joe");
    harness.manager.enqueue_request(first.clone());
    let frames = thread.wait_outbound(1, IO_TIMEOUT);
    let request = Request::parse(&frames[0]).unwrap();
    harness.manager.response_received(&response_frame(
        &request,
        Status::Success,
        r#"{"rbac":{"joe":{}}}"#,
    ));
    first.wait_timeout(IO_TIMEOUT).expect("first resolved");

    // The cache is now warm, so the next authentication skips authorization.
    let second = client_task(2, "joe");
    harness.manager.enqueue_request(second.clone());
    let frames = thread.wait_outbound(1, IO_TIMEOUT);
    let request = Request::parse(&frames[0]).unwrap();
    let body: serde_json::Value = serde_json::from_slice(&request.value).unwrap();
    assert_eq!(body["authentication-only"], true);

    harness.manager.response_received(&response_frame(
        &request,
        Status::Success,
        "{}",
    ));
    second.wait_timeout(IO_TIMEOUT).expect("second resolved");

    harness.stop();
}

#[test]
fn get_authorization_requests_key_the_username() {
    let harness = Harness::start(Settings::default());
    let (conn, thread) = provider(600);
    harness.manager.add_provider(conn);

    let client_thread = WorkerThread::new("client-authz");
    let client = Connection::new(7, "[client - local]", client_thread);
    let task = AuthTask::new(
        AuthRequest::GetAuthorization {
            username: "osbourne".into(),
        },
        client,
    );
    harness.manager.enqueue_request(task.clone());

    let frames = thread.wait_outbound(1, IO_TIMEOUT);
    let request = Request::parse(&frames[0]).unwrap();
    assert_eq!(request.opcode, ServerOpcode::GetAuthorization as u8);
    assert_eq!(&request.key[..], b"osbourne");

    harness.manager.response_received(&response_frame(
        &request,
        Status::AuthError,
        r#"{"error":{"context":"no such user"}}"#,
    ));
    let result = task.wait_timeout(IO_TIMEOUT).expect("task resolved");
    assert_eq!(result.status, Status::AuthError);

    harness.stop();
}
