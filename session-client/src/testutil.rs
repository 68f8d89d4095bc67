//! Shared helpers for in-crate tests: a scriptable transport, a recording
//! notification sink, and a structural token minter.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::SessionResult;
use crate::http::{HttpResponse, HttpTransport, RequestDescriptor, AUTHORIZATION};
use crate::notify::NotificationSink;

/// Mint a structurally valid three-segment token. The signature segment is a
/// throwaway; nothing in this crate verifies it.
pub(crate) fn mint_token(
    sub: &str,
    email: &str,
    name: &str,
    roles: &[&str],
    permissions: &[&str],
    exp: i64,
) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = serde_json::json!({
        "sub": sub,
        "email": email,
        "name": name,
        "roles": roles,
        "permissions": permissions,
        "exp": exp,
        "iat": exp - 3600,
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.sig")
}

pub(crate) struct RecordedCall {
    pub(crate) path: String,
    pub(crate) bearer: Option<String>,
}

struct Scripted {
    delay: Option<Duration>,
    result: SessionResult<HttpResponse>,
}

/// Transport that replays scripted responses per path (FIFO) and records
/// every call it sees. Unscripted paths answer 404.
#[derive(Default)]
pub(crate) struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, path: &str, result: SessionResult<HttpResponse>) {
        self.script_delayed(path, None, result);
    }

    pub(crate) fn script_delayed(
        &self,
        path: &str,
        delay: Option<Duration>,
        result: SessionResult<HttpResponse>,
    ) {
        let mut guard = self.scripts.lock().expect("script mutex poisoned");
        guard
            .entry(path.to_string())
            .or_default()
            .push_back(Scripted { delay, result });
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        let guard = self.calls.lock().expect("calls mutex poisoned");
        guard.iter().filter(|call| call.path == path).count()
    }

    pub(crate) fn last_bearer(&self, path: &str) -> Option<String> {
        let guard = self.calls.lock().expect("calls mutex poisoned");
        guard
            .iter()
            .rev()
            .find(|call| call.path == path)
            .and_then(|call| call.bearer.clone())
    }

    pub(crate) fn response(status: u16, body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send_http(&self, request: &RequestDescriptor) -> SessionResult<HttpResponse> {
        let bearer = request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(AUTHORIZATION))
            .map(|(_, value)| value.clone());
        {
            let mut guard = self.calls.lock().expect("calls mutex poisoned");
            guard.push(RecordedCall {
                path: request.path.clone(),
                bearer,
            });
        }

        let next = {
            let mut guard = self.scripts.lock().expect("script mutex poisoned");
            guard
                .get_mut(&request.path)
                .and_then(|queue| queue.pop_front())
        };

        match next {
            Some(scripted) => {
                if let Some(delay) = scripted.delay {
                    tokio::time::sleep(delay).await;
                }
                scripted.result
            }
            None => Ok(HttpResponse {
                status: 404,
                headers: Vec::new(),
                body: String::new(),
            }),
        }
    }
}

/// Notification sink that records everything it is handed.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) errors: Mutex<Vec<(&'static str, String)>>,
    pub(crate) successes: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn error(&self, category: &'static str, message: String) {
        self.errors
            .lock()
            .expect("sink mutex poisoned")
            .push((category, message));
    }

    async fn success(&self, message: String) {
        self.successes
            .lock()
            .expect("sink mutex poisoned")
            .push(message);
    }
}
