//! Login, logout, initialization and the proactive refresh timer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FakeBackend, LOGOUT, REFRESH, VERIFY, alice, config, logged_in_manager, manager, wait_until,
};
use parking_lot::Mutex;
use session_core::{
    Credential, CredentialStore, LoginRequest, MemoryPersistence, Notice, NoticeAction, Notifier,
    PersistedSession, SessionError, SessionManager, SessionStatus,
};

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: &Notice) {
        self.notices.lock().push(notice.clone());
    }
}

/// Give detached tasks a few turns to run to completion.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn persisted(token: &str) -> Arc<MemoryPersistence> {
    Arc::new(MemoryPersistence::with_session(PersistedSession {
        access_token: Some(Credential::new(token)),
        user_info: Some(alice()),
    }))
}

#[tokio::test]
async fn test_login_installs_session_and_starts_timer() {
    let backend = FakeBackend::new();
    let manager = manager(&backend);

    let outcome = manager.login(LoginRequest::new("alice", "x")).await.unwrap();

    assert_eq!(outcome.user.id, 1);
    assert_eq!(outcome.user.username, "alice");
    assert_eq!(outcome.message.as_deref(), Some("Login successful"));
    assert_eq!(manager.credential(), Some(Credential::new("tok1")));
    assert_eq!(manager.current_user().map(|u| u.id), Some(1));
    assert!(manager.is_logged_in());
    assert!(manager.has_refresh_timer());

    let response = manager.get("/api/resume/list").await.unwrap();
    assert_eq!(response.body["token"], "tok1");
    manager.shutdown();
}

#[tokio::test]
async fn test_invalid_login_leaves_store_untouched() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok0");

    let err = manager
        .login(LoginRequest::new("alice", "wrong"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::InvalidCredentials(ref m) if m == "Invalid username or password"
    ));
    assert_eq!(manager.credential(), Some(Credential::new("tok0")));
    assert_eq!(manager.current_user(), Some(alice()));
    assert!(!manager.has_refresh_timer());
    assert_eq!(backend.count(REFRESH), 0);
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let backend = FakeBackend::new();
    let persistence = persisted("tok1");
    backend.accept_token("tok1");
    let store = CredentialStore::load(persistence.clone()).unwrap();
    let manager = SessionManager::new(config(), backend.clone(), store).unwrap();

    manager.logout().await;
    manager.logout().await;

    assert!(!manager.is_logged_in());
    assert!(manager.credential().is_none());
    assert!(persistence.snapshot().is_empty());
    // Only the first logout had a credential to announce.
    assert_eq!(backend.count(LOGOUT), 1);
}

#[tokio::test]
async fn test_logout_survives_backend_failure() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok1");
    backend.respond_with(LOGOUT, 503, serde_json::json!({"message": "down"}));

    manager.logout().await;

    assert!(!manager.is_logged_in());
    assert!(manager.credential().is_none());
}

#[tokio::test]
async fn test_initialize_without_credential_is_logged_out() {
    let backend = FakeBackend::new();
    let manager = manager(&backend);

    assert_eq!(manager.initialize().await, SessionStatus::LoggedOut);
    assert_eq!(backend.count(VERIFY), 0);
    assert!(!manager.has_refresh_timer());
}

#[tokio::test]
async fn test_initialize_verifies_persisted_credential() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok1");

    let status = manager.initialize().await;

    let SessionStatus::LoggedIn(user) = status else {
        panic!("expected a restored session");
    };
    // The verified record replaces the persisted one.
    assert_eq!(user.email.as_deref(), Some("alice@example.com"));
    assert_eq!(manager.current_user(), Some(user));
    assert!(manager.has_refresh_timer());
    assert_eq!(backend.calls_to(VERIFY)[0].bearer(), Some("tok1"));
    manager.shutdown();
    assert!(!manager.has_refresh_timer());
}

#[tokio::test]
async fn test_initialize_clears_rejected_credential() {
    let backend = FakeBackend::new();
    let persistence = persisted("stale");
    let store = CredentialStore::load(persistence.clone()).unwrap();
    let manager = SessionManager::new(config(), backend.clone(), store).unwrap();

    let status = manager.initialize().await;

    assert_eq!(status, SessionStatus::LoggedOut);
    assert!(!status.is_logged_in());
    assert!(manager.credential().is_none());
    assert!(persistence.snapshot().is_empty());
    assert!(!manager.has_refresh_timer());
    // Verification never goes through the refresh path.
    assert_eq!(backend.count(REFRESH), 0);
}

#[tokio::test]
async fn test_logout_rejects_queued_calls_and_discards_refresh() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok1");
    backend.revoke_all();
    let gate = backend.gate(REFRESH);

    let caller = manager.clone();
    let queued = tokio::spawn(async move { caller.get("/api/a").await });
    wait_until(|| manager.pending_replays() == 1).await;

    manager.logout().await;
    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::SessionTerminated));
    assert!(!manager.is_refreshing());

    // Let the abandoned refresh finish; its credential must not be installed.
    gate.add_permits(1);
    settle().await;

    assert!(manager.credential().is_none());
    assert!(!manager.is_logged_in());
    assert_eq!(backend.calls_to("/api/a").len(), 1);
}

#[tokio::test]
async fn test_login_drops_calls_queued_by_previous_session() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok0");
    backend.revoke_all();
    let gate = backend.gate(REFRESH);

    let caller = manager.clone();
    let queued = tokio::spawn(async move { caller.get("/api/a").await });
    wait_until(|| manager.pending_replays() == 1).await;

    manager.login(LoginRequest::new("alice", "x")).await.unwrap();
    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::SessionTerminated));

    gate.add_permits(1);
    settle().await;

    assert_eq!(manager.credential(), Some(Credential::new("tok1")));
    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_timer_refreshes_proactively() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok1");
    assert!(manager.initialize().await.is_logged_in());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.count(REFRESH), 0);

    tokio::time::sleep(Duration::from_secs(31)).await;
    wait_until(|| manager.credential() == Some(Credential::new("tok2"))).await;
    assert_eq!(backend.count(REFRESH), 1);
    assert!(manager.is_logged_in());
    assert!(manager.has_refresh_timer());

    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_timer_refresh_failure_logs_out() {
    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok1");
    assert!(manager.initialize().await.is_logged_in());
    backend.fail_refresh(500);

    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_until(|| !manager.is_logged_in()).await;

    assert!(manager.credential().is_none());
    assert!(!manager.has_refresh_timer());
    assert_eq!(backend.count(LOGOUT), 1);
}

#[tokio::test]
async fn test_session_survives_restart_through_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let backend = FakeBackend::new();

    let first = SessionManager::builder(config().with_state_file(&path))
        .transport(backend.clone())
        .build()
        .unwrap();
    first.login(LoginRequest::new("alice", "x")).await.unwrap();
    first.shutdown();
    drop(first);

    let second = SessionManager::builder(config().with_state_file(&path))
        .transport(backend.clone())
        .build()
        .unwrap();
    assert_eq!(second.credential(), Some(Credential::new("tok1")));
    assert!(second.initialize().await.is_logged_in());

    second.logout().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_failures_reach_the_notifier() {
    let backend = FakeBackend::new();
    backend.accept_token("tok1");
    backend.respond_with("/api/missing", 404, serde_json::json!({"message": "no such resume"}));
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = SessionManager::builder(config())
        .transport(backend.clone())
        .store(CredentialStore::load(persisted("tok1")).unwrap())
        .notifier(notifier.clone())
        .build()
        .unwrap();

    manager.get("/api/missing").await.unwrap_err();
    manager
        .login(LoginRequest::new("alice", "wrong"))
        .await
        .unwrap_err();
    manager.get("/api/resume/list").await.unwrap();

    let notices = notifier.notices.lock().clone();
    assert_eq!(notices.len(), 2);
    assert_eq!(notices[0].action, NoticeAction::None);
    assert_eq!(notices[1].action, NoticeAction::Reauthenticate);
    assert_eq!(notices[1].message, "Invalid username or password");
}

#[tokio::test]
async fn test_verb_helpers_are_authenticated() {
    #[derive(serde::Deserialize)]
    struct Echo {
        path: String,
        token: String,
    }

    let backend = FakeBackend::new();
    let manager = logged_in_manager(&backend, "tok1");
    let body = serde_json::json!({"title": "CV"});

    manager.post("/api/resume", &body).await.unwrap();
    manager.put("/api/resume/1", &body).await.unwrap();
    manager.patch("/api/resume/1", &body).await.unwrap();
    manager.delete("/api/resume/1").await.unwrap();
    let echo: Echo = manager
        .request_json(session_core::ApiRequest::get("/api/profile"))
        .await
        .unwrap();
    assert_eq!(echo.path, "/api/profile");
    assert_eq!(echo.token, "tok1");

    let methods: Vec<String> = backend.calls().into_iter().map(|call| call.method).collect();
    assert_eq!(methods, vec!["POST", "PUT", "PATCH", "DELETE", "GET"]);
    assert!(backend.calls().iter().all(|call| call.bearer() == Some("tok1")));
}
