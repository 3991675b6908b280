//! Single-flight credential refresh and request replay.
//!
//! At most one refresh call is in flight. Every refresh-eligible failure that
//! arrives while it is outstanding is parked in a FIFO queue of
//! [`PendingCall`]s instead of triggering another refresh. When the refresh
//! settles the queue is drained in arrival order: each call is replayed once
//! with the new credential, or rejected without touching the network if the
//! refresh failed.

use std::collections::VecDeque;
use std::mem;

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::models::{Credential, RefreshResponse};
use crate::session::SessionManager;
use crate::transport::{ApiRequest, ApiResponse};

/// A deferred call waiting for the outcome of the current refresh.
pub(crate) struct PendingCall {
    request: ApiRequest,
    reply: oneshot::Sender<Result<ApiResponse>>,
}

/// How a refresh ended, as seen by callers waiting on it without a request.
#[derive(Debug, Clone)]
pub(crate) enum RefreshOutcome {
    Renewed(Credential),
    Failed,
    Terminated,
}

impl RefreshOutcome {
    fn into_result(self) -> Result<Credential> {
        match self {
            Self::Renewed(credential) => Ok(credential),
            Self::Failed => Err(SessionError::AuthExpired),
            Self::Terminated => Err(SessionError::SessionTerminated),
        }
    }
}

/// Coordinator state. `refreshing` is true iff a refresh call is in flight;
/// `queue` and `waiters` are empty whenever it is false.
#[derive(Default)]
pub(crate) struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingCall>,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    /// Bumped whenever the session is replaced or torn down, so a refresh
    /// that settles afterwards cannot resurrect it.
    epoch: u64,
}

/// Entries taken out of the coordinator when a refresh settles.
#[derive(Default)]
pub(crate) struct Drained {
    calls: VecDeque<PendingCall>,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

impl Drained {
    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Fail every entry without issuing any request.
    pub(crate) fn reject(self, error: impl Fn() -> SessionError, outcome: RefreshOutcome) {
        for call in self.calls {
            let _ = call.reply.send(Err(error()));
        }
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl RefreshState {
    #[inline]
    pub(crate) fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    #[inline]
    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Back to `Idle`, handing over everything that was waiting.
    pub(crate) fn settle(&mut self) -> Drained {
        self.refreshing = false;
        Drained {
            calls: mem::take(&mut self.queue),
            waiters: mem::take(&mut self.waiters),
        }
    }

    /// Invalidate any in-flight refresh and return to `Idle`.
    pub(crate) fn reset(&mut self) -> Drained {
        self.epoch = self.epoch.wrapping_add(1);
        self.settle()
    }
}

enum Admission {
    /// Parked behind the refresh that is already running.
    Queued,
    /// First failure: a refresh for this epoch has to be started.
    Start(u64),
    /// The request failed with a credential that has since been replaced.
    Stale(ApiRequest),
    /// The session is already gone; there is nothing to refresh.
    Ended,
}

impl SessionManager {
    /// Resolve a call that failed with 401 and has not been retried yet.
    ///
    /// The call is either replayed exactly once after a successful refresh or
    /// rejected exactly once; `Unauthorized` never escapes from here.
    pub(crate) async fn recover_unauthorized(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        request.mark_retried();

        let (reply, receiver) = oneshot::channel();
        let admission = {
            let mut state = self.inner.refresh.lock();
            if state.refreshing {
                state.queue.push_back(PendingCall { request, reply });
                Admission::Queued
            } else {
                let current = self.inner.store.credential();
                if current.is_none() {
                    Admission::Ended
                } else if current.as_ref() != request.sent_with() {
                    Admission::Stale(request)
                } else {
                    state.refreshing = true;
                    state.queue.push_back(PendingCall { request, reply });
                    Admission::Start(state.epoch)
                }
            }
        };

        match admission {
            Admission::Queued => {
                debug!("Refresh already in flight; call queued for replay");
            }
            Admission::Start(epoch) => {
                info!("Credential rejected; starting refresh");
                self.spawn_refresh(epoch);
            }
            Admission::Ended => {
                debug!("No session to refresh");
                return Err(SessionError::AuthExpired);
            }
            Admission::Stale(request) => {
                debug!(path = %request.path, "Credential changed while request was in flight; replaying");
                return self.replay(request).await;
            }
        }

        // A dropped sender means the coordinator task went away with the session.
        receiver.await.unwrap_or(Err(SessionError::SessionTerminated))
    }

    /// Refresh the credential now, sharing any refresh already in flight.
    #[instrument(skip(self))]
    pub async fn refresh_now(&self) -> Result<Credential> {
        let (waiter, receiver) = oneshot::channel();
        let start = {
            let mut state = self.inner.refresh.lock();
            state.waiters.push(waiter);
            if state.refreshing {
                None
            } else {
                state.refreshing = true;
                Some(state.epoch)
            }
        };

        if let Some(epoch) = start {
            self.spawn_refresh(epoch);
        }

        receiver
            .await
            .unwrap_or(RefreshOutcome::Terminated)
            .into_result()
    }

    /// The refresh runs detached so that no caller dropping its future can
    /// strand the queue.
    fn spawn_refresh(&self, epoch: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_refresh(epoch).await;
        });
    }

    #[instrument(skip(self))]
    async fn run_refresh(&self, epoch: u64) {
        let fetched = self.fetch_new_credential().await;

        // A failed refresh clears the session in the same critical section
        // that settles the coordinator.
        let settled = {
            let mut state = self.inner.refresh.lock();
            if state.epoch != epoch {
                debug!("Session ended while refreshing; discarding refresh result");
                return;
            }
            let outcome = fetched.and_then(|credential| {
                self.inner.store.set_credential(credential.clone())?;
                Ok(credential)
            });
            match outcome {
                Ok(credential) => Ok((credential, state.settle())),
                Err(e) => Err((e, self.clear_locked(&mut state))),
            }
        };

        match settled {
            Ok((credential, drained)) => {
                info!(replays = drained.len(), "Credential refreshed");
                for waiter in drained.waiters {
                    let _ = waiter.send(RefreshOutcome::Renewed(credential.clone()));
                }
                self.replay_all(drained.calls).await;
            }
            Err((e, (previous, drained))) => {
                warn!(error = %e, rejected = drained.len(), "Credential refresh failed; ending session");
                self.finish_teardown(drained, || SessionError::AuthExpired, RefreshOutcome::Failed);
                self.announce_logout(previous).await;
            }
        }
    }

    /// Replay drained calls. `join_all` polls its futures in order, so the
    /// replays are issued in queue order while still running concurrently.
    async fn replay_all(&self, calls: VecDeque<PendingCall>) {
        let replays = calls.into_iter().map(|call| async move {
            let result = self.replay(call.request).await;
            let _ = call.reply.send(result);
        });
        join_all(replays).await;
    }

    /// Issue an already retried request with the current credential. A second
    /// 401 is terminal.
    pub(crate) async fn replay(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        match self.send_once(&mut request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_refresh_eligible() => Err(self.expire_session(&request).await),
            Err(e) => Err(e),
        }
    }

    /// Call the refresh endpoint with the current credential.
    async fn fetch_new_credential(&self) -> Result<Credential> {
        if self.inner.store.credential().is_none() {
            return Err(SessionError::AuthExpired);
        }

        let request = ApiRequest::post(self.inner.config.endpoints.refresh.clone());
        let response = self.call_token_endpoint(request).await?;
        let body: RefreshResponse = response.json()?;

        match body.access_token {
            Some(credential) if body.success && !credential.is_empty() => Ok(credential),
            _ => Err(SessionError::invalid_response(
                body.message
                    .unwrap_or_else(|| "refresh response carried no access token".to_string()),
            )),
        }
    }
}
