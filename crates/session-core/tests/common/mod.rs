//! In-process stand-in for the backend used by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use session_core::{
    ApiRequest, ApiResponse, Credential, CredentialStore, MemoryPersistence, PersistedSession,
    SessionConfig, SessionManager, Transport, TransportError, User,
};
use tokio::sync::Semaphore;

pub const LOGIN: &str = "/api/auth/login";
pub const REFRESH: &str = "/api/auth/refresh-token";
pub const VERIFY: &str = "/api/auth/verify-token";
pub const LOGOUT: &str = "/api/auth/logout";

/// What the backend saw for one attempt.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub retried: bool,
}

impl RecordedCall {
    pub fn bearer(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "))
    }
}

struct BackendState {
    valid_tokens: HashSet<String>,
    refresh_tokens: VecDeque<String>,
    refresh_status: Option<u16>,
    locked_paths: HashSet<String>,
    timeout_paths: HashSet<String>,
    status_paths: HashMap<String, (u16, Value)>,
}

/// Scriptable backend implementing [`Transport`].
///
/// Token endpoints behave like the real service; every other path answers
/// 200 for a currently valid bearer token and 401 otherwise.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    calls: Mutex<Vec<RecordedCall>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                valid_tokens: HashSet::new(),
                refresh_tokens: VecDeque::new(),
                refresh_status: None,
                locked_paths: HashSet::new(),
                timeout_paths: HashSet::new(),
                status_paths: HashMap::new(),
            }),
            calls: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn accept_token(&self, token: &str) {
        self.state.lock().valid_tokens.insert(token.to_string());
    }

    pub fn revoke_all(&self) {
        self.state.lock().valid_tokens.clear();
    }

    /// Tokens handed out by successive refresh calls; "tok2" once the list runs out.
    pub fn issue_on_refresh(&self, tokens: &[&str]) {
        self.state.lock().refresh_tokens = tokens.iter().map(|t| t.to_string()).collect();
    }

    /// Make the refresh endpoint answer with this status.
    pub fn fail_refresh(&self, status: u16) {
        self.state.lock().refresh_status = Some(status);
    }

    /// Path that answers 401 no matter which credential is presented.
    pub fn lock_path(&self, path: &str) {
        self.state.lock().locked_paths.insert(path.to_string());
    }

    pub fn timeout_path(&self, path: &str) {
        self.state.lock().timeout_paths.insert(path.to_string());
    }

    pub fn respond_with(&self, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .status_paths
            .insert(path.to_string(), (status, body));
    }

    /// Hold every call to `path` until the returned gate gets a permit.
    pub fn gate(&self, path: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(path.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls_to(path).len()
    }

    fn handle(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let bearer = request
            .header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
        let mut state = self.state.lock();
        let authorized = bearer
            .as_ref()
            .is_some_and(|token| state.valid_tokens.contains(token));

        if state.timeout_paths.contains(&request.path) {
            return Err(TransportError::Timeout("operation timed out".into()));
        }
        if let Some((status, body)) = state.status_paths.get(&request.path) {
            return reply(*status, body.clone());
        }

        match request.path.as_str() {
            LOGIN => {
                let body = request.body.clone().unwrap_or(Value::Null);
                if body["username"] == "alice" && body["password"] == "x" {
                    state.valid_tokens.insert("tok1".to_string());
                    reply(
                        200,
                        json!({
                            "success": true,
                            "message": "Login successful",
                            "access_token": "tok1",
                            "user": {"id": 1, "username": "alice"}
                        }),
                    )
                } else {
                    reply(
                        401,
                        json!({"success": false, "message": "Invalid username or password"}),
                    )
                }
            }
            REFRESH => {
                if let Some(status) = state.refresh_status {
                    return reply(status, json!({"success": false, "message": "Refresh failed"}));
                }
                // Like the real service, any presented token can be exchanged.
                if bearer.is_none() {
                    return reply(401, json!({"success": false, "message": "Missing token"}));
                }
                let issued = match state.refresh_tokens.pop_front() {
                    Some(token) => token,
                    None => "tok2".to_string(),
                };
                state.valid_tokens.clear();
                state.valid_tokens.insert(issued.clone());
                reply(
                    200,
                    json!({"success": true, "access_token": issued, "message": "Token refreshed"}),
                )
            }
            VERIFY => {
                if authorized {
                    reply(
                        200,
                        json!({
                            "success": true,
                            "user": {"id": 1, "username": "alice", "email": "alice@example.com"}
                        }),
                    )
                } else {
                    reply(401, json!({"success": false, "message": "Token expired"}))
                }
            }
            LOGOUT => reply(200, json!({"success": true, "message": "Logged out"})),
            path if state.locked_paths.contains(path) => {
                reply(401, json!({"success": false, "message": "Token expired"}))
            }
            path if authorized => reply(200, json!({"path": path, "token": bearer})),
            _ => reply(401, json!({"success": false, "message": "Token expired"})),
        }
    }
}

fn reply(status: u16, body: Value) -> Result<ApiResponse, TransportError> {
    if (200..300).contains(&status) {
        Ok(ApiResponse::new(status, body))
    } else {
        Err(TransportError::Status { status, body })
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.calls.lock().push(RecordedCall {
            method: request.method.to_string(),
            path: request.path.clone(),
            authorization: request.header("authorization").map(str::to_string),
            retried: request.is_retried(),
        });

        let gate = self.gates.lock().get(&request.path).cloned();
        if let Some(gate) = gate {
            // Each holder hands its permit back on drop, so one permit opens the gate for everyone.
            let _permit = gate.acquire().await.expect("gate closed");
        }

        self.handle(request)
    }
}

pub fn alice() -> User {
    User {
        id: 1,
        username: "alice".to_string(),
        email: None,
        avatar: None,
        role: None,
    }
}

pub fn config() -> SessionConfig {
    SessionConfig::new("http://backend.test").with_refresh_interval(Duration::from_secs(60))
}

/// A manager with an empty in-memory store.
pub fn manager(backend: &Arc<FakeBackend>) -> SessionManager {
    SessionManager::new(config(), backend.clone(), CredentialStore::in_memory())
        .expect("valid test config")
}

/// A manager already holding `token` for alice, with the backend accepting it.
pub fn logged_in_manager(backend: &Arc<FakeBackend>, token: &str) -> SessionManager {
    backend.accept_token(token);
    let persistence = Arc::new(MemoryPersistence::with_session(PersistedSession {
        access_token: Some(Credential::new(token)),
        user_info: Some(alice()),
    }));
    let store = CredentialStore::load(persistence).expect("memory persistence");
    SessionManager::new(config(), backend.clone(), store).expect("valid test config")
}

/// Yield until `condition` holds. Panics after a bounded number of turns.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
