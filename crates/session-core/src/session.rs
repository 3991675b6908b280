//! Session lifecycle.
//!
//! [`SessionManager`] is the single handle through which every authenticated
//! call is made. It is cheap to clone; all clones share one credential store,
//! one refresh coordinator and one proactive refresh timer.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::classify::classify;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::interceptor;
use crate::models::{
    Credential, LoginOutcome, LoginRequest, LoginResponse, LogoutResponse, SessionStatus, User,
    VerifyResponse,
};
use crate::notice::{Notice, Notifier, TracingNotifier};
use crate::refresh::{Drained, RefreshOutcome, RefreshState};
use crate::store::{CredentialStore, FilePersistence};
use crate::timer::SessionTimer;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

pub(crate) struct Inner {
    pub(crate) config: SessionConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: CredentialStore,
    pub(crate) refresh: Mutex<RefreshState>,
    timer: Mutex<Option<SessionTimer>>,
    notifier: Arc<dyn Notifier>,
}

/// Handle to an authenticated session.
#[derive(Clone)]
pub struct SessionManager {
    pub(crate) inner: Arc<Inner>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<CredentialStore>,
    notifier: Arc<dyn Notifier>,
}

impl SessionManagerBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Missing pieces are derived from the configuration: an [`HttpTransport`]
    /// for the base URL and a file-backed store when `state_file` is set.
    pub fn build(self) -> Result<SessionManager> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&self.config)?),
        };
        let store = match self.store {
            Some(store) => store,
            None => match &self.config.state_file {
                Some(path) => CredentialStore::load(Arc::new(FilePersistence::new(path)))?,
                None => CredentialStore::in_memory(),
            },
        };

        Ok(SessionManager {
            inner: Arc::new(Inner {
                config: self.config,
                transport,
                store,
                refresh: Mutex::new(RefreshState::default()),
                timer: Mutex::new(None),
                notifier: self.notifier,
            }),
        })
    }
}

impl SessionManager {
    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            transport: None,
            store: None,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        store: CredentialStore,
    ) -> Result<Self> {
        Self::builder(config).transport(transport).store(store).build()
    }

    pub(crate) fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.store.credential()
    }

    pub fn current_user(&self) -> Option<User> {
        self.inner.store.user()
    }

    /// True only when both a credential and a user record are held.
    pub fn is_logged_in(&self) -> bool {
        self.inner.store.is_logged_in()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.lock().is_refreshing()
    }

    /// Number of calls waiting for the in-flight refresh.
    pub fn pending_replays(&self) -> usize {
        self.inner.refresh.lock().queued()
    }

    pub fn has_refresh_timer(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(SessionTimer::is_running)
    }

    /// Trust a persisted credential only after the backend confirms it.
    ///
    /// Never fails: a rejected or unverifiable credential is cleared and the
    /// session starts logged out.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> SessionStatus {
        if self.inner.store.credential().is_none() {
            debug!("No persisted credential");
            return SessionStatus::LoggedOut;
        }

        let verified = match self.verify().await {
            Ok(user) => self.inner.store.set_user(user.clone()).map(|_| user),
            Err(e) => Err(e),
        };

        match verified {
            Ok(user) => {
                self.start_timer();
                info!(user_id = user.id, username = %user.username, "Restored persisted session");
                SessionStatus::LoggedIn(user)
            }
            Err(e) => {
                warn!(error = %e, "Persisted credential rejected; clearing session");
                self.logout().await;
                SessionStatus::LoggedOut
            }
        }
    }

    /// Exchange username and password for a session.
    ///
    /// Stored state is untouched unless the login succeeds.
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    pub async fn login(&self, credentials: LoginRequest) -> Result<LoginOutcome> {
        let result = self.try_login(&credentials).await;
        match &result {
            Ok(outcome) => {
                info!(user_id = outcome.user.id, "Login succeeded");
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.inner.notifier.notify(&Notice::for_error(e));
            }
        }
        result
    }

    async fn try_login(&self, credentials: &LoginRequest) -> Result<LoginOutcome> {
        let request = ApiRequest::post(self.inner.config.endpoints.login.clone())
            .with_json(serde_json::to_value(credentials)?);

        let response = self
            .call_token_endpoint(request)
            .await
            .map_err(|e| match e {
                SessionError::Unauthorized(message)
                | SessionError::Unclassified {
                    status: 400,
                    message,
                } => SessionError::InvalidCredentials(message),
                other => other,
            })?;
        let body: LoginResponse = response.json()?;

        if !body.success {
            return Err(SessionError::InvalidCredentials(
                body.message.unwrap_or_else(|| "Login failed".to_string()),
            ));
        }
        let (Some(credential), Some(user)) = (body.access_token, body.user) else {
            return Err(SessionError::invalid_response(
                "login response is missing the access token or user",
            ));
        };

        self.install_session(credential, user.clone())?;
        self.start_timer();

        Ok(LoginOutcome {
            user,
            message: body.message,
        })
    }

    /// Store a fresh session, invalidating anything tied to the previous one.
    fn install_session(&self, credential: Credential, user: User) -> Result<()> {
        let drained = {
            let mut state = self.inner.refresh.lock();
            self.inner.store.set(credential, user)?;
            state.reset()
        };
        let rejected = drained.len();
        if rejected > 0 {
            debug!(rejected, "Dropping calls queued by the previous session");
        }
        drained.reject(|| SessionError::SessionTerminated, RefreshOutcome::Terminated);
        Ok(())
    }

    /// End the session.
    ///
    /// Local state is cleared first, so nothing observes the old credential
    /// once this starts. The backend is then told on a best-effort basis.
    /// Calling this when already logged out only repeats the clearing steps.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        let previous = self.teardown(
            || SessionError::SessionTerminated,
            RefreshOutcome::Terminated,
        );
        self.announce_logout(previous).await;
    }

    /// Clear the store, invalidate any in-flight refresh and stop the timer.
    /// Queued calls are rejected with `error`. Returns the credential that was
    /// held, if any.
    fn teardown(
        &self,
        error: impl Fn() -> SessionError,
        outcome: RefreshOutcome,
    ) -> Option<Credential> {
        let (previous, drained) = {
            let mut state = self.inner.refresh.lock();
            self.clear_locked(&mut state)
        };
        self.finish_teardown(drained, error, outcome);
        previous
    }

    /// Store and coordinator part of a teardown. The caller holds the refresh lock.
    pub(crate) fn clear_locked(&self, state: &mut RefreshState) -> (Option<Credential>, Drained) {
        let previous = self.inner.store.credential();
        if let Err(e) = self.inner.store.clear() {
            error!(error = %e, "Failed to clear persisted session");
        }
        (previous, state.reset())
    }

    pub(crate) fn finish_teardown(
        &self,
        drained: Drained,
        error: impl Fn() -> SessionError,
        outcome: RefreshOutcome,
    ) {
        self.stop_timer();
        let rejected = drained.len();
        drained.reject(error, outcome);
        info!(rejected, "Session cleared");
    }

    /// Best-effort backend logout with the credential that was just dropped.
    pub(crate) async fn announce_logout(&self, credential: Option<Credential>) {
        let Some(credential) = credential else {
            return;
        };

        let mut request = ApiRequest::post(self.inner.config.endpoints.logout.clone());
        match self.send_as(&mut request, Some(&credential)).await {
            Ok(response) => {
                let acknowledged = response
                    .json::<LogoutResponse>()
                    .is_ok_and(|body| body.success);
                debug!(acknowledged, "Backend logout sent");
            }
            Err(e) => warn!(error = %e, "Backend logout failed (ignored)"),
        }
    }

    /// Stop background work. The stored session is left as is.
    pub fn shutdown(&self) {
        self.stop_timer();
    }

    /// Issue an authenticated request.
    ///
    /// A 401 is absorbed by the refresh coordinator: the call resolves to the
    /// replayed response or to `AuthExpired`/`SessionTerminated`.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let result = self.execute(request).await;
        if let Err(e) = &result {
            self.inner.notifier.notify(&Notice::for_error(e));
        }
        result
    }

    /// [`request`](Self::request) and decode the response body.
    pub async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        self.request(request).await?.json()
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(path)).await
    }

    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.request(ApiRequest::post(path).with_json(serde_json::to_value(body)?))
            .await
    }

    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.request(ApiRequest::put(path).with_json(serde_json::to_value(body)?))
            .await
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<ApiResponse> {
        self.request(ApiRequest::patch(path).with_json(serde_json::to_value(body)?))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::delete(path)).await
    }

    async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        let err = match self.send_once(&mut request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        if !err.is_refresh_eligible() {
            return Err(err);
        }
        if request.is_retried() {
            return Err(self.expire_session(&request).await);
        }
        self.recover_unauthorized(request).await
    }

    /// Decorate and send one attempt with the current credential.
    pub(crate) async fn send_once(&self, request: &mut ApiRequest) -> Result<ApiResponse> {
        let credential = self.inner.store.credential();
        self.send_as(request, credential.as_ref()).await
    }

    async fn send_as(
        &self,
        request: &mut ApiRequest,
        credential: Option<&Credential>,
    ) -> Result<ApiResponse> {
        interceptor::decorate(request, credential);

        debug!(
            method = %request.method,
            path = %request.path,
            retried = request.is_retried(),
            "Sending request"
        );

        self.inner.transport.send(request).await.map_err(classify)
    }

    /// Token endpoints bypass the refresh coordinator.
    pub(crate) async fn call_token_endpoint(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        self.send_once(&mut request).await
    }

    /// A retried call was rejected again: the session cannot be recovered.
    pub(crate) async fn expire_session(&self, request: &ApiRequest) -> SessionError {
        warn!(path = %request.path, "Still unauthorized after refresh; ending session");
        let previous = self.teardown(|| SessionError::AuthExpired, RefreshOutcome::Failed);
        self.announce_logout(previous).await;
        SessionError::AuthExpired
    }

    async fn verify(&self) -> Result<User> {
        let request = ApiRequest::post(self.inner.config.endpoints.verify.clone());
        let body: VerifyResponse = self.call_token_endpoint(request).await?.json()?;

        match body.user {
            Some(user) if body.success => Ok(user),
            _ => Err(SessionError::AuthExpired),
        }
    }

    fn start_timer(&self) {
        let timer = SessionTimer::start(
            Arc::downgrade(&self.inner),
            self.inner.config.refresh_interval,
        );
        if let Some(previous) = self.inner.timer.lock().replace(timer) {
            previous.stop();
        }
        debug!(interval = ?self.inner.config.refresh_interval, "Refresh timer started");
    }

    fn stop_timer(&self) {
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("base_url", &self.inner.config.base_url)
            .field("store", &self.inner.store)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}
