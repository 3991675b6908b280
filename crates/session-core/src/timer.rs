//! Proactive refresh timer.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::{Inner, SessionManager};

/// Recurring refresh task owned by the session lifecycle.
///
/// The task only holds a weak reference to the session, so a forgotten timer
/// never keeps a dropped manager alive.
pub(crate) struct SessionTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SessionTimer {
    /// First tick fires one full period after start.
    pub(crate) fn start(session: Weak<Inner>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Refresh timer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(manager) = SessionManager::upgrade(&session) else {
                            break;
                        };
                        if manager.credential().is_none() {
                            continue;
                        }

                        // Failures end the session through the refresh path; the loop itself keeps going.
                        match manager.refresh_now().await {
                            Ok(_) => debug!("Proactive refresh succeeded"),
                            Err(e) => warn!(error = %e, "Proactive refresh failed"),
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    pub(crate) fn stop(self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
