use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::claims::{self, Claims};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::http::{HttpTransport, Method, RequestDescriptor, ReqwestTransport};
use crate::metrics::SessionMetrics;
use crate::notify::{self, NotificationSink, TracingSink};
use crate::pipeline::{PendingQueue, TransportPipeline};
use crate::refresh::RefreshCoordinator;
use crate::session::{SessionSnapshot, SessionStateHandle, User};
use crate::store::{KeyValueStore, MemoryStore, TokenStore};

/// Credentials submitted to the login endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

/// Canonical envelope returned by the login and refresh endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenEnvelope {
    token: String,
    expires_in: i64,
}

/// Shared innards behind the facade and the pipeline.
pub(crate) struct SessionCore {
    pub(crate) config: SessionConfig,
    pub(crate) tokens: TokenStore,
    pub(crate) transport: Arc<dyn HttpTransport>,
    pub(crate) refresh: RefreshCoordinator,
    pub(crate) state: SessionStateHandle,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) metrics: SessionMetrics,
    pub(crate) pending: PendingQueue,
    // Bumped whenever the session is replaced (login, logout, forced logout).
    // A refresh settling against an older epoch is discarded rather than
    // applied to the session that replaced it.
    epoch: AtomicU64,
}

impl SessionCore {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Bootstrap from persisted storage.
    pub(crate) async fn initialize(self: &Arc<Self>) {
        let Some(token) = self.tokens.load().await else {
            debug!("no persisted token; starting unauthenticated");
            self.state.set_unauthenticated(None);
            return;
        };

        match claims::decode_unverified(&token) {
            Ok(claims) if !claims.is_expired() => {
                debug!(subject = %claims.subject, "restored session from storage");
                self.state
                    .set_authenticated(token, User::from(&claims));
                self.schedule_proactive(&claims);
            }
            Ok(_) => {
                debug!("persisted token already expired; clearing");
                self.tokens.clear().await;
                self.state.set_unauthenticated(None);
            }
            Err(err) => {
                warn!(%err, "persisted token undecodable; clearing");
                self.tokens.clear().await;
                self.state.set_unauthenticated(None);
            }
        }
    }

    /// Install a freshly issued token as the current session.
    ///
    /// A token that cannot back a session (malformed, or expired on arrival)
    /// clears storage and drops to unauthenticated; per the propagation
    /// policy that fallback is local and the decode failure is not surfaced
    /// to login callers.
    async fn install_token(self: &Arc<Self>, token: &str) -> SessionResult<Claims> {
        let claims = match claims::decode_unverified(token) {
            Ok(claims) if !claims.is_expired() => claims,
            Ok(_) => {
                warn!("issued token is already expired; discarding");
                self.tokens.clear().await;
                self.state.set_unauthenticated(None);
                return Err(SessionError::Decode(
                    "issued token already expired".to_string(),
                ));
            }
            Err(err) => {
                warn!(%err, "issued token failed to decode; discarding");
                self.tokens.clear().await;
                self.state.set_unauthenticated(None);
                return Err(err);
            }
        };

        self.tokens.save(token, Some(claims.expires_at)).await;
        self.state
            .set_authenticated(token.to_string(), User::from(&claims));
        self.schedule_proactive(&claims);
        Ok(claims)
    }

    fn schedule_proactive(self: &Arc<Self>, claims: &Claims) {
        let weak = Arc::downgrade(self);
        let epoch = self.current_epoch();
        self.refresh.schedule_proactive(claims.expires_at, async move {
            let Some(core) = weak.upgrade() else { return };
            if core.current_epoch() != epoch {
                debug!("stale proactive timer; session was replaced");
                return;
            }
            debug!("proactive refresh firing ahead of token expiry");
            let _ = core.refresh_session("proactive").await;
        });
    }

    /// The raw refresh call: POST to the refresh endpoint with the current
    /// bearer, expecting the canonical token envelope. Goes straight to the
    /// transport; the pipeline's 401 handling must not recurse into itself.
    async fn perform_refresh_call(&self) -> SessionResult<String> {
        let mut descriptor =
            RequestDescriptor::new(Method::Post, self.config.refresh_path.clone());
        if let Some(token) = self.state.token() {
            descriptor.set_bearer(&token);
        }

        let response = self.transport.send_http(&descriptor).await?;
        if !response.is_success() {
            return Err(SessionError::from_status(
                response.status,
                response.error_message(),
            ));
        }

        let envelope: TokenEnvelope = response.json()?;
        debug!(
            expires_in = envelope.expires_in,
            "refresh endpoint issued a new token"
        );
        Ok(envelope.token)
    }

    /// Single entry point for every refresh trigger (reactive, proactive,
    /// manual). Deduplicates through the coordinator, applies the outcome to
    /// the session exactly once (leader side), and releases the pending
    /// queue.
    pub(crate) async fn refresh_session(
        self: &Arc<Self>,
        trigger: &'static str,
    ) -> SessionResult<String> {
        let epoch = self.current_epoch();
        let op_core = Arc::clone(self);
        let (raw, led) = self
            .refresh
            .refresh_now_led(move || async move {
                op_core.state.set_loading(true);
                op_core.perform_refresh_call().await
            })
            .await;

        let outcome = if led {
            self.settle_refresh(raw, epoch, trigger).await
        } else {
            raw
        };

        // Every caller drains after settlement so no parked request is left
        // behind, whichever task enqueued last.
        self.pending.drain(&outcome);
        outcome
    }

    async fn settle_refresh(
        self: &Arc<Self>,
        raw: SessionResult<String>,
        epoch: u64,
        trigger: &'static str,
    ) -> SessionResult<String> {
        if self.current_epoch() != epoch {
            debug!(trigger, "discarding refresh outcome from a replaced session");
            self.state.set_loading(false);
            return Err(SessionError::SessionExpired);
        }

        match raw {
            Ok(token) => match self.install_token(&token).await {
                Ok(_) => {
                    self.metrics.refresh_attempt(trigger, "success");
                    info!(trigger, "session refreshed");
                    Ok(token)
                }
                Err(_) => {
                    self.metrics.refresh_attempt(trigger, "failure");
                    self.force_logout().await;
                    Err(SessionError::SessionExpired)
                }
            },
            Err(err) => {
                warn!(trigger, %err, "token refresh failed");
                self.metrics.refresh_attempt(trigger, "failure");
                self.force_logout().await;
                Err(err)
            }
        }
    }

    /// Teardown after an unrecoverable refresh failure: the one place a
    /// visible "session expired" notice is emitted.
    async fn force_logout(&self) {
        self.refresh.cancel();
        self.bump_epoch();
        self.tokens.clear().await;
        self.state
            .set_unauthenticated(Some(SessionError::SessionExpired));
        notify::notify_error(self.notifier.as_ref(), &SessionError::SessionExpired).await;
    }

    pub(crate) async fn login(self: &Arc<Self>, credentials: &LoginCredentials) -> SessionResult<()> {
        self.state.begin_operation();
        let pipeline = TransportPipeline::new(Arc::clone(self));
        let descriptor = RequestDescriptor::post(
            self.config.login_path.clone(),
            serde_json::json!({
                "email": credentials.email,
                "password": credentials.password,
            }),
        )
        .unauthenticated();

        let envelope = match pipeline
            .send(descriptor)
            .await
            .and_then(|response| response.json::<TokenEnvelope>())
        {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(email = %credentials.email, %err, "login failed");
                self.metrics.login_attempt("failure");
                self.state.set_error(err.clone());
                return Err(err);
            }
        };

        // The new session replaces whatever was there; a stale timer must
        // never fire against it, and an earlier refresh failure no longer
        // applies.
        self.refresh.reset();
        self.bump_epoch();

        match self.install_token(&envelope.token).await {
            Ok(claims) => {
                info!(
                    subject = %claims.subject,
                    expires_in = envelope.expires_in,
                    "user logged in"
                );
                self.metrics.login_attempt("success");
                self.notifier.success("Login successful".to_string()).await;
                Ok(())
            }
            Err(_) => {
                // Handled locally: storage cleared, state unauthenticated.
                self.metrics.login_attempt("invalid_token");
                Ok(())
            }
        }
    }

    /// Local teardown only; no network call, nothing to fail.
    pub(crate) async fn logout(&self) {
        self.refresh.reset();
        self.bump_epoch();
        self.tokens.clear().await;
        self.state.set_unauthenticated(None);
        info!("user logged out");
        self.notifier.success("Logged out".to_string()).await;
    }
}

/// Public surface over the session core: the sole mutator of session state.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<SessionCore>,
}

impl SessionManager {
    pub fn builder(config: SessionConfig) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config)
    }

    pub async fn login(&self, credentials: LoginCredentials) -> SessionResult<()> {
        self.core.login(&credentials).await
    }

    /// Idempotent; calling it on an already-ended session is a no-op ending.
    pub async fn logout(&self) {
        self.core.logout().await;
    }

    pub async fn refresh_token(&self) -> SessionResult<()> {
        self.core.refresh_session("manual").await.map(|_| ())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.core.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.core.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.core.state.snapshot().is_authenticated
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.core
            .state
            .user()
            .is_some_and(|user| user.roles.iter().any(|value| value == role))
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        self.core
            .state
            .user()
            .is_some_and(|user| user.roles.iter().any(|value| roles.contains(&value.as_str())))
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.core
            .state
            .user()
            .is_some_and(|user| user.permissions.iter().any(|value| value == permission))
    }

    pub fn has_any_permission(&self, permissions: &[&str]) -> bool {
        self.core.state.user().is_some_and(|user| {
            user.permissions
                .iter()
                .any(|value| permissions.contains(&value.as_str()))
        })
    }

    /// Request pipeline bound to this session.
    pub fn pipeline(&self) -> TransportPipeline {
        TransportPipeline::new(Arc::clone(&self.core))
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.core.metrics
    }
}

pub struct SessionManagerBuilder {
    config: SessionConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl SessionManagerBuilder {
    fn new(config: SessionConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            notifier: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the manager and initialize it from persisted storage.
    pub async fn build(self) -> anyhow::Result<SessionManager> {
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config)?),
        };
        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let notifier: Arc<dyn NotificationSink> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(TracingSink),
        };

        let tokens = TokenStore::new(store, self.config.storage_key.clone());
        let refresh =
            RefreshCoordinator::new(self.config.refresh_timeout, self.config.refresh_skew);

        let core = Arc::new(SessionCore {
            tokens,
            transport,
            refresh,
            state: SessionStateHandle::new(),
            notifier,
            metrics: SessionMetrics::new()?,
            pending: PendingQueue::new(),
            epoch: AtomicU64::new(0),
            config: self.config,
        });
        core.initialize().await;

        Ok(SessionManager { core })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{mint_token, MockTransport, RecordingSink};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn fresh_token(ttl_seconds: i64) -> String {
        let exp = (Utc::now() + chrono::Duration::seconds(ttl_seconds)).timestamp();
        mint_token(
            "user-1",
            "a@b.com",
            "Ada",
            &["admin"],
            &["orders:write"],
            exp,
        )
    }

    async fn build_manager(
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
    ) -> (SessionManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let manager = SessionManager::builder(SessionConfig::new("https://api.example.test"))
            .with_store(store)
            .with_transport(transport)
            .with_notifier(Arc::clone(&sink) as Arc<dyn NotificationSink>)
            .build()
            .await
            .expect("manager builds");
        (manager, sink)
    }

    fn credentials() -> LoginCredentials {
        LoginCredentials {
            email: "a@b.com".to_string(),
            password: "x".to_string(),
        }
    }

    #[tokio::test]
    async fn login_establishes_session() {
        let transport = MockTransport::new();
        let token = fresh_token(3600);
        transport.script(
            "/auth/login",
            Ok(MockTransport::response(
                200,
                json!({"token": token, "expiresIn": 3600}),
            )),
        );
        let store = Arc::new(MemoryStore::new());
        let (manager, sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        manager.login(credentials()).await.expect("login succeeds");

        let snapshot = manager.snapshot();
        assert!(snapshot.is_authenticated);
        assert!(!snapshot.is_loading);
        assert!(snapshot.error.is_none());
        assert_eq!(
            snapshot.user.as_ref().map(|user| user.email.as_str()),
            Some("a@b.com")
        );
        assert!(manager.has_role("admin"));
        assert!(manager.has_any_role(&["manager", "admin"]));
        assert!(!manager.has_role("manager"));
        assert!(manager.has_permission("orders:write"));
        assert!(!manager.has_any_permission(&["orders:delete"]));

        assert_eq!(store.get("auth_token").await.as_deref(), Some(token.as_str()));
        // Login is sent unauthenticated.
        assert_eq!(transport.last_bearer("/auth/login"), None);
        assert_eq!(sink.successes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn login_failure_sets_error_and_leaves_no_session() {
        let transport = MockTransport::new();
        transport.script(
            "/auth/login",
            Ok(MockTransport::response(
                401,
                json!({"message": "bad credentials"}),
            )),
        );
        let store = Arc::new(MemoryStore::new());
        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        let err = manager
            .login(credentials())
            .await
            .expect_err("login should fail");
        assert_eq!(err, SessionError::Unauthorized);

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated);
        assert_eq!(snapshot.error, Some(SessionError::Unauthorized));
        assert_eq!(store.get("auth_token").await, None);
        // A login 401 is bad credentials, never an expired-session trigger.
        assert_eq!(transport.calls_to("/auth/refresh"), 0);
    }

    #[tokio::test]
    async fn login_with_undecodable_token_falls_back_unauthenticated() {
        let transport = MockTransport::new();
        transport.script(
            "/auth/login",
            Ok(MockTransport::response(
                200,
                json!({"token": "garbage", "expiresIn": 3600}),
            )),
        );
        let store = Arc::new(MemoryStore::new());
        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        // The decode failure is handled locally, not surfaced.
        manager.login(credentials()).await.expect("login returns ok");
        assert!(!manager.snapshot().is_authenticated);
        assert_eq!(store.get("auth_token").await, None);
    }

    #[tokio::test]
    async fn initialize_restores_persisted_session() {
        let transport = MockTransport::new();
        let token = fresh_token(3600);
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &token).await;

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        let snapshot = manager.snapshot();
        assert!(snapshot.is_authenticated);
        assert_eq!(snapshot.token.as_deref(), Some(token.as_str()));
        // Restoration is storage-only.
        assert_eq!(transport.calls_to("/auth/login"), 0);
        assert_eq!(transport.calls_to("/auth/refresh"), 0);
    }

    #[tokio::test]
    async fn initialize_clears_expired_token() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(-60)).await;

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        assert!(!manager.snapshot().is_authenticated);
        assert_eq!(store.get("auth_token").await, None);
    }

    #[tokio::test]
    async fn initialize_clears_undecodable_token() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", "two.segments").await;

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        assert!(!manager.snapshot().is_authenticated);
        assert_eq!(store.get("auth_token").await, None);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;
        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        assert!(manager.is_authenticated());

        manager.logout().await;
        manager.logout().await;

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated);
        assert!(snapshot.error.is_none());
        assert_eq!(store.get("auth_token").await, None);
    }

    #[tokio::test]
    async fn role_queries_are_false_when_unauthenticated() {
        let transport = MockTransport::new();
        let (manager, _sink) =
            build_manager(Arc::clone(&transport), Arc::new(MemoryStore::new())).await;

        assert!(!manager.has_role("admin"));
        assert!(!manager.has_any_role(&["admin", "manager"]));
        assert!(!manager.has_permission("orders:write"));
        assert!(!manager.has_any_permission(&["orders:write"]));
    }

    #[tokio::test]
    async fn unauthorized_request_refreshes_and_replays() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        let new_token = fresh_token(7200);
        transport.script("/orders", Ok(MockTransport::response(401, json!({}))));
        transport.script("/orders", Ok(MockTransport::response(200, json!({"orders": []}))));
        transport.script(
            "/auth/refresh",
            Ok(MockTransport::response(
                200,
                json!({"token": new_token, "expiresIn": 7200}),
            )),
        );

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        let response = manager
            .pipeline()
            .get("/orders")
            .await
            .expect("replay succeeds");

        assert_eq!(response.status, 200);
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
        assert_eq!(transport.calls_to("/orders"), 2);
        assert_eq!(
            transport.last_bearer("/orders"),
            Some(format!("Bearer {new_token}"))
        );
        assert_eq!(manager.snapshot().token.as_deref(), Some(new_token.as_str()));
        assert_eq!(
            store.get("auth_token").await.as_deref(),
            Some(new_token.as_str())
        );
    }

    #[tokio::test]
    async fn request_replayed_once_then_fails_without_second_refresh() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        transport.script("/orders", Ok(MockTransport::response(401, json!({}))));
        transport.script("/orders", Ok(MockTransport::response(401, json!({}))));
        transport.script(
            "/auth/refresh",
            Ok(MockTransport::response(
                200,
                json!({"token": fresh_token(7200), "expiresIn": 7200}),
            )),
        );

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        let err = manager
            .pipeline()
            .get("/orders")
            .await
            .expect_err("second 401 fails outright");

        assert_eq!(err, SessionError::Unauthorized);
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
        assert_eq!(transport.calls_to("/orders"), 2);
        // The request failed; the refreshed session itself is intact.
        assert!(manager.is_authenticated());
    }

    #[tokio::test]
    async fn refresh_failure_rejects_all_queued_requests() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        for _ in 0..3 {
            transport.script("/orders", Ok(MockTransport::response(401, json!({}))));
        }
        transport.script("/auth/refresh", Ok(MockTransport::response(401, json!({}))));

        let (manager, sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        let pipeline = manager.pipeline();
        let (a, b, c) = tokio::join!(
            pipeline.get("/orders"),
            pipeline.get("/orders"),
            pipeline.get("/orders")
        );

        for outcome in [a, b, c] {
            assert_eq!(
                outcome.expect_err("queued request rejected"),
                SessionError::SessionExpired
            );
        }
        // One refresh call for all three; the sticky failure covers the rest.
        assert_eq!(transport.calls_to("/auth/refresh"), 1);

        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated);
        assert_eq!(snapshot.error, Some(SessionError::SessionExpired));
        assert_eq!(store.get("auth_token").await, None);
        assert!(sink
            .errors
            .lock()
            .unwrap()
            .iter()
            .any(|(category, _)| *category == "session_expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_forces_logout() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;
        transport.script_delayed(
            "/auth/refresh",
            Some(Duration::from_secs(60)),
            Ok(MockTransport::response(
                200,
                json!({"token": fresh_token(7200), "expiresIn": 7200}),
            )),
        );

        let (manager, sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        let err = manager
            .refresh_token()
            .await
            .expect_err("refresh should time out");

        assert_eq!(err, SessionError::RefreshTimeout);
        let snapshot = manager.snapshot();
        assert!(!snapshot.is_authenticated);
        assert_eq!(snapshot.error, Some(SessionError::SessionExpired));
        assert_eq!(store.get("auth_token").await, None);
        assert!(sink
            .errors
            .lock()
            .unwrap()
            .iter()
            .any(|(category, _)| *category == "session_expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_rejects_queued_requests_together() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        for _ in 0..3 {
            transport.script("/orders", Ok(MockTransport::response(401, json!({}))));
        }
        transport.script_delayed(
            "/auth/refresh",
            Some(Duration::from_secs(60)),
            Ok(MockTransport::response(
                200,
                json!({"token": fresh_token(7200), "expiresIn": 7200}),
            )),
        );

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        let pipeline = manager.pipeline();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move { pipeline.get("/orders").await }));
        }

        for handle in handles {
            let outcome = handle.await.expect("task");
            assert_eq!(
                outcome.expect_err("queued request rejected"),
                SessionError::SessionExpired
            );
        }

        assert_eq!(transport.calls_to("/auth/refresh"), 1);
        assert!(!manager.snapshot().is_authenticated);
    }

    #[tokio::test]
    async fn manual_refresh_updates_session() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        let new_token = fresh_token(7200);
        transport.script(
            "/auth/refresh",
            Ok(MockTransport::response(
                200,
                json!({"token": new_token, "expiresIn": 7200}),
            )),
        );

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        manager.refresh_token().await.expect("refresh succeeds");

        assert_eq!(manager.snapshot().token.as_deref(), Some(new_token.as_str()));
        let rendered = manager.metrics().render().expect("metrics render");
        assert!(rendered.contains("session_refresh_total"));
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_refresh_fires_once_before_expiry() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        let new_token = fresh_token(7200);
        transport.script(
            "/auth/refresh",
            Ok(MockTransport::response(
                200,
                json!({"token": new_token, "expiresIn": 7200}),
            )),
        );

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;

        // Armed for expiry minus the 300s skew; nothing fires early.
        tokio::time::advance(Duration::from_secs(3200)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.calls_to("/auth/refresh"), 0);

        tokio::time::advance(Duration::from_secs(150)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
        assert_eq!(manager.snapshot().token.as_deref(), Some(new_token.as_str()));

        // The replacement token re-armed the timer for its own window.
        tokio::time::advance(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_disarms_proactive_timer() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;
        transport.script(
            "/auth/refresh",
            Ok(MockTransport::response(
                200,
                json!({"token": fresh_token(7200), "expiresIn": 7200}),
            )),
        );

        let (manager, _sink) = build_manager(Arc::clone(&transport), Arc::clone(&store)).await;
        manager.logout().await;

        tokio::time::advance(Duration::from_secs(7200)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.calls_to("/auth/refresh"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_arriving_during_refresh_waits_for_settlement() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set("auth_token", &fresh_token(3600)).await;

        let new_token = fresh_token(7200);
        transport.script("/orders", Ok(MockTransport::response(401, json!({}))));
        transport.script("/orders", Ok(MockTransport::response(200, json!({"orders": []}))));
        transport.script("/profile", Ok(MockTransport::response(200, json!({"user": {}}))));
        transport.script_delayed(
            "/auth/refresh",
            Some(Duration::from_secs(5)),
            Ok(MockTransport::response(
                200,
                json!({"token": new_token, "expiresIn": 7200}),
            )),
        );

        let config = SessionConfig::new("https://api.example.test")
            .with_refresh_timeout(Duration::from_secs(30));
        let sink = Arc::new(RecordingSink::default());
        let manager = SessionManager::builder(config)
            .with_store(Arc::clone(&store) as Arc<dyn KeyValueStore>)
            .with_transport(Arc::clone(&transport) as Arc<dyn HttpTransport>)
            .with_notifier(sink)
            .build()
            .await
            .expect("manager builds");

        let pipeline = manager.pipeline();
        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.get("/orders").await }
        });
        tokio::task::yield_now().await;
        assert!(manager.core.refresh.is_in_flight());

        // Submitted while the refresh is settling: parks, then proceeds with
        // the fresh token.
        let second = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.get("/profile").await }
        });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(5)).await;

        let first = first.await.expect("task").expect("replay succeeds");
        let second = second.await.expect("task").expect("parked request succeeds");
        assert_eq!(first.status, 200);
        assert_eq!(second.status, 200);
        assert_eq!(transport.calls_to("/auth/refresh"), 1);
        assert_eq!(
            transport.last_bearer("/profile"),
            Some(format!("Bearer {new_token}"))
        );
    }
}
