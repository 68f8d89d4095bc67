use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::http::{HttpResponse, RequestDescriptor};
use crate::manager::SessionCore;
use crate::notify;
use crate::refresh::RefreshCoordinator;

struct PendingRequest {
    id: Uuid,
    enqueued_at: Instant,
    tx: oneshot::Sender<SessionResult<String>>,
}

/// FIFO queue of requests parked behind an in-flight refresh.
///
/// Entries are owned here until the refresh settles, then released in enqueue
/// order: success hands each waiter the fresh token, failure rejects them all
/// uniformly with `SessionExpired`.
#[derive(Default)]
pub(crate) struct PendingQueue {
    inner: Mutex<VecDeque<PendingRequest>>,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(&self, id: Uuid) -> oneshot::Receiver<SessionResult<String>> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock().expect("pending queue mutex poisoned");
        guard.push_back(PendingRequest {
            id,
            enqueued_at: Instant::now(),
            tx,
        });
        rx
    }

    pub(crate) fn drain(&self, outcome: &SessionResult<String>) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut guard = self.inner.lock().expect("pending queue mutex poisoned");
            guard.drain(..).collect()
        };
        let released = drained.len();
        for pending in drained {
            let payload = match outcome {
                Ok(token) => Ok(token.clone()),
                Err(_) => Err(SessionError::SessionExpired),
            };
            debug!(
                id = %pending.id,
                waited = ?pending.enqueued_at.elapsed(),
                "releasing pending request"
            );
            let _ = pending.tx.send(payload);
        }
        released
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("pending queue mutex poisoned")
            .len()
    }
}

/// Request/response interception around the raw transport: attaches the
/// bearer header, detects unauthorized responses, triggers the shared
/// refresh, and replays requests once it settles.
#[derive(Clone)]
pub struct TransportPipeline {
    core: Arc<SessionCore>,
}

impl TransportPipeline {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub async fn send(&self, mut descriptor: RequestDescriptor) -> SessionResult<HttpResponse> {
        let core = &self.core;

        // A request arriving while a refresh is settling parks until the
        // shared outcome is known; it then carries the fresh token or is
        // rejected together with everything else that waited.
        let mut replay_token: Option<String> = None;
        if descriptor.authenticate {
            if let Some(rx) = core.refresh.in_flight_outcome() {
                debug!(id = %descriptor.id, "parking request behind in-flight refresh");
                match RefreshCoordinator::wait_for_outcome(rx).await {
                    Ok(token) => replay_token = Some(token),
                    Err(_) => {
                        core.metrics.request_rejected();
                        return Err(SessionError::SessionExpired);
                    }
                }
            }
        }

        loop {
            if descriptor.authenticate {
                match replay_token.take().or_else(|| core.state.token()) {
                    Some(token) => descriptor.set_bearer(&token),
                    None => descriptor.clear_bearer(),
                }
            }

            let response = match core.transport.send_http(&descriptor).await {
                Ok(response) => response,
                Err(err) => {
                    notify::notify_error(core.notifier.as_ref(), &err).await;
                    return Err(err);
                }
            };

            if response.is_success() {
                return Ok(response);
            }

            if response.status == 401 && descriptor.authenticate {
                // A request that still faults after one replay must not loop.
                if descriptor.retried {
                    let err = SessionError::Unauthorized;
                    notify::notify_error(core.notifier.as_ref(), &err).await;
                    return Err(err);
                }
                descriptor.retried = true;
                debug!(id = %descriptor.id, "unauthorized response; queueing behind refresh");
                let rx = core.pending.enqueue(descriptor.id);
                let _ = core.refresh_session("reactive").await;
                match rx.await {
                    Ok(Ok(token)) => {
                        core.metrics.request_replayed();
                        replay_token = Some(token);
                        continue;
                    }
                    Ok(Err(err)) => {
                        core.metrics.request_rejected();
                        return Err(err);
                    }
                    Err(_) => {
                        core.metrics.request_rejected();
                        return Err(SessionError::SessionExpired);
                    }
                }
            }

            let err = SessionError::from_status(response.status, response.error_message());
            notify::notify_error(core.notifier.as_ref(), &err).await;
            return Err(err);
        }
    }

    pub async fn get(&self, path: impl Into<String>) -> SessionResult<HttpResponse> {
        self.send(RequestDescriptor::get(path)).await
    }

    pub async fn post(
        &self,
        path: impl Into<String>,
        body: serde_json::Value,
    ) -> SessionResult<HttpResponse> {
        self.send(RequestDescriptor::post(path, body)).await
    }

    pub async fn put(
        &self,
        path: impl Into<String>,
        body: serde_json::Value,
    ) -> SessionResult<HttpResponse> {
        self.send(RequestDescriptor::put(path, body)).await
    }

    pub async fn patch(
        &self,
        path: impl Into<String>,
        body: serde_json::Value,
    ) -> SessionResult<HttpResponse> {
        self.send(RequestDescriptor::patch(path, body)).await
    }

    pub async fn delete(&self, path: impl Into<String>) -> SessionResult<HttpResponse> {
        self.send(RequestDescriptor::delete(path)).await
    }
}
