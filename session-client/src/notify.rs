use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::SessionError;

/// Sink for user-visible notices the host surfaces as toasts/banners.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn error(&self, category: &'static str, message: String);
    async fn success(&self, message: String);
}

/// Default sink: routes notices through `tracing` only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn error(&self, category: &'static str, message: String) {
        warn!(category, %message, "session notice");
    }

    async fn success(&self, message: String) {
        info!(%message, "session notice");
    }
}

pub(crate) async fn notify_error(sink: &dyn NotificationSink, error: &SessionError) {
    sink.error(error.category(), error.to_string()).await;
}
