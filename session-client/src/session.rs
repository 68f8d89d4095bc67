use serde::Serialize;
use tokio::sync::watch;

use crate::claims::Claims;
use crate::error::SessionError;

/// Identity carried by the current session, built from decoded claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl From<&Claims> for User {
    fn from(claims: &Claims) -> Self {
        Self {
            id: claims.subject.clone(),
            email: claims.email.clone(),
            name: claims.name.clone(),
            roles: claims.roles.clone(),
            permissions: claims.permissions.clone(),
        }
    }
}

/// Point-in-time view of the session, published to subscribers on every
/// transition.
///
/// Invariant: `is_authenticated` is true exactly when `token` holds a value
/// that was unexpired at the transition that produced this snapshot.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub user: Option<User>,
    pub token: Option<String>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub error: Option<SessionError>,
}

/// Single owner of the session snapshot; mutated only by the manager.
pub(crate) struct SessionStateHandle {
    tx: watch::Sender<SessionSnapshot>,
}

impl SessionStateHandle {
    /// Starts in the initializing state: not authenticated, loading.
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot {
            is_loading: true,
            ..SessionSnapshot::default()
        });
        Self { tx }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    pub(crate) fn token(&self) -> Option<String> {
        self.tx.borrow().token.clone()
    }

    pub(crate) fn user(&self) -> Option<User> {
        self.tx.borrow().user.clone()
    }

    pub(crate) fn set_authenticated(&self, token: String, user: User) {
        self.tx.send_modify(|state| {
            state.user = Some(user);
            state.token = Some(token);
            state.is_authenticated = true;
            state.is_loading = false;
            state.error = None;
        });
    }

    pub(crate) fn set_unauthenticated(&self, error: Option<SessionError>) {
        self.tx.send_modify(|state| {
            state.user = None;
            state.token = None;
            state.is_authenticated = false;
            state.is_loading = false;
            state.error = error;
        });
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.tx.send_modify(|state| {
            state.is_loading = loading;
        });
    }

    /// Entering a login/refresh call: loading, with any stale error cleared.
    pub(crate) fn begin_operation(&self) {
        self.tx.send_modify(|state| {
            state.is_loading = true;
            state.error = None;
        });
    }

    pub(crate) fn set_error(&self, error: SessionError) {
        self.tx.send_modify(|state| {
            state.is_loading = false;
            state.error = Some(error);
        });
    }
}
