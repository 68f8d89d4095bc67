use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

type SharedOutcome = watch::Receiver<Option<SessionResult<String>>>;

/// Refresh lifecycle. At most one `InFlight` exists per coordinator; `Failed`
/// is sticky until `reset()` so a dead refresh credential is never retried
/// automatically.
enum RefreshState {
    Idle,
    InFlight(SharedOutcome),
    Failed(SessionError),
}

/// Serializes token refresh: deduplicates concurrent refresh attempts into a
/// single network call (single-flight) and owns the proactive refresh timer.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    refresh_timeout: Duration,
    skew: Duration,
}

/// Resets the coordinator if the leader's future is dropped mid-flight, so a
/// cancelled refresh cannot wedge every later caller in `InFlight`.
struct LeaderGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut guard = self
                .coordinator
                .state
                .lock()
                .expect("refresh state mutex poisoned");
            *guard = RefreshState::Idle;
        }
    }
}

impl RefreshCoordinator {
    pub fn new(refresh_timeout: Duration, skew: Duration) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            timer: Mutex::new(None),
            refresh_timeout,
            skew,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        let guard = self.state.lock().expect("refresh state mutex poisoned");
        matches!(&*guard, RefreshState::InFlight(_))
    }

    /// The shared outcome channel of the in-flight refresh, if one is running.
    pub(crate) fn in_flight_outcome(&self) -> Option<SharedOutcome> {
        let guard = self.state.lock().expect("refresh state mutex poisoned");
        match &*guard {
            RefreshState::InFlight(rx) => Some(rx.clone()),
            _ => None,
        }
    }

    /// Run `op` under single-flight semantics.
    ///
    /// The first caller becomes the leader: it runs `op` under the refresh
    /// timeout and publishes the outcome to every concurrent caller. Callers
    /// arriving while a refresh is in flight await that same outcome; no
    /// second network call is made. A sticky failure is returned as-is until
    /// `reset()` clears it.
    pub async fn refresh_now<F, Fut>(&self, op: F) -> SessionResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SessionResult<String>>,
    {
        self.refresh_now_led(op).await.0
    }

    /// As [`refresh_now`](Self::refresh_now), additionally reporting whether
    /// this caller led the flight. Settlement side effects (state transitions,
    /// forced logout, queue release) must run exactly once, so they key off
    /// the leader.
    pub(crate) async fn refresh_now_led<F, Fut>(&self, op: F) -> (SessionResult<String>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SessionResult<String>>,
    {
        enum Decision {
            Wait(SharedOutcome),
            Failed(SessionError),
            Lead(watch::Sender<Option<SessionResult<String>>>),
        }

        let decision = {
            let mut guard = self.state.lock().expect("refresh state mutex poisoned");
            match &*guard {
                RefreshState::InFlight(rx) => Decision::Wait(rx.clone()),
                RefreshState::Failed(reason) => {
                    debug!(%reason, "refresh short-circuited by earlier failure");
                    Decision::Failed(reason.clone())
                }
                RefreshState::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *guard = RefreshState::InFlight(rx);
                    Decision::Lead(tx)
                }
            }
        };

        let tx = match decision {
            Decision::Wait(rx) => return (Self::wait_for_outcome(rx).await, false),
            Decision::Failed(reason) => return (Err(reason), false),
            Decision::Lead(tx) => tx,
        };

        let mut leader = LeaderGuard {
            coordinator: self,
            settled: false,
        };

        let outcome = match tokio::time::timeout(self.refresh_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::RefreshTimeout),
        };

        {
            let mut guard = self.state.lock().expect("refresh state mutex poisoned");
            *guard = match &outcome {
                Ok(_) => RefreshState::Idle,
                Err(reason) => RefreshState::Failed(reason.clone()),
            };
        }
        leader.settled = true;

        // Waiters may already be gone; that is fine.
        let _ = tx.send(Some(outcome.clone()));
        (outcome, true)
    }

    pub(crate) async fn wait_for_outcome(mut rx: SharedOutcome) -> SessionResult<String> {
        let settled = rx.wait_for(|value| value.is_some()).await.map_err(|_| {
            warn!("in-flight refresh was dropped before settling");
            SessionError::Network("refresh was interrupted".to_string())
        })?;
        settled
            .clone()
            .expect("wait_for guarantees a settled outcome")
    }

    /// Arm the proactive refresh timer for `expires_at - skew`.
    ///
    /// Fires `task` immediately when that instant is already past. Re-arming
    /// replaces any previously armed timer; at most one is live.
    pub fn schedule_proactive<F>(&self, expires_at: DateTime<Utc>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = (expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(self.skew);
        debug!(?delay, %expires_at, "arming proactive refresh timer");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        let mut guard = self.timer.lock().expect("refresh timer mutex poisoned");
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    /// Clear any armed proactive timer. Used by logout and by the
    /// forced-logout path; the latter deliberately leaves a sticky failure in
    /// place so concurrent waiters still observe it.
    pub fn cancel(&self) {
        let mut guard = self.timer.lock().expect("refresh timer mutex poisoned");
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    /// Full teardown: clear the timer and any sticky failure. Used when the
    /// session itself is replaced (logout, new login), after which refreshing
    /// is allowed to try again.
    pub fn reset(&self) {
        self.cancel();
        let mut state = self.state.lock().expect("refresh state mutex poisoned");
        if matches!(&*state, RefreshState::Failed(_)) {
            *state = RefreshState::Idle;
        }
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.timer.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn coordinator() -> Arc<RefreshCoordinator> {
        Arc::new(RefreshCoordinator::new(
            Duration::from_secs(5),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_call() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh_now(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("new.token.value".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.expect("task");
            assert_eq!(outcome, Ok("new.token.value".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_shared_and_sticky_until_reset() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::Unauthorized)
                }
            }
        };

        let first = coordinator.refresh_now(failing.clone()).await;
        assert_eq!(first, Err(SessionError::Unauthorized));

        // No retry against a dead refresh credential.
        let second = coordinator.refresh_now(failing.clone()).await;
        assert_eq!(second, Err(SessionError::Unauthorized));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        coordinator.reset();
        let third = coordinator
            .refresh_now(|| async { Ok("fresh.token.value".to_string()) })
            .await;
        assert_eq!(third, Ok("fresh.token.value".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_times_out() {
        let coordinator = Arc::new(RefreshCoordinator::new(
            Duration::from_secs(2),
            Duration::from_secs(300),
        ));

        let outcome = coordinator
            .refresh_now(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too.late.token".to_string())
            })
            .await;
        assert_eq!(outcome, Err(SessionError::RefreshTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_timer_fires_once_after_skew_window() {
        let coordinator = coordinator();
        let fired = Arc::new(AtomicUsize::new(0));

        let expires_at = Utc::now() + chrono::Duration::seconds(3600);
        let task_fired = Arc::clone(&fired);
        coordinator.schedule_proactive(expires_at, async move {
            task_fired.fetch_add(1, Ordering::SeqCst);
        });

        // 3600 - 300 skew: nothing before the mark.
        tokio::time::advance(Duration::from_secs(3299)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let coordinator = coordinator();
        let first_fired = Arc::new(AtomicUsize::new(0));
        let second_fired = Arc::new(AtomicUsize::new(0));

        let expires_at = Utc::now() + chrono::Duration::seconds(1000);
        let marker = Arc::clone(&first_fired);
        coordinator.schedule_proactive(expires_at, async move {
            marker.fetch_add(1, Ordering::SeqCst);
        });

        let marker = Arc::clone(&second_fired);
        coordinator.schedule_proactive(expires_at, async move {
            marker.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(2000)).await;
        tokio::task::yield_now().await;
        assert_eq!(first_fired.load(Ordering::SeqCst), 0);
        assert_eq!(second_fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_fires_immediately() {
        let coordinator = coordinator();
        let fired = Arc::new(AtomicUsize::new(0));

        let expires_at = Utc::now() - chrono::Duration::seconds(10);
        let marker = Arc::clone(&fired);
        coordinator.schedule_proactive(expires_at, async move {
            marker.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_disarms_timer() {
        let coordinator = coordinator();
        let fired = Arc::new(AtomicUsize::new(0));

        let expires_at = Utc::now() + chrono::Duration::seconds(400);
        let marker = Arc::clone(&fired);
        coordinator.schedule_proactive(expires_at, async move {
            marker.fetch_add(1, Ordering::SeqCst);
        });
        coordinator.cancel();

        tokio::time::advance(Duration::from_secs(1000)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
