use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct SessionMetrics {
    registry: Registry,
    login_attempts: IntCounterVec,
    refresh_attempts: IntCounterVec,
    requests_replayed: IntCounter,
    requests_rejected: IntCounter,
}

impl SessionMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let login_attempts = IntCounterVec::new(
            Opts::new(
                "session_login_attempts_total",
                "Count of login attempts grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(login_attempts.clone()))?;

        let refresh_attempts = IntCounterVec::new(
            Opts::new(
                "session_refresh_total",
                "Count of token refresh attempts grouped by trigger and outcome",
            ),
            &["trigger", "outcome"],
        )?;
        registry.register(Box::new(refresh_attempts.clone()))?;

        let requests_replayed = IntCounter::new(
            "session_requests_replayed_total",
            "Requests replayed with a fresh token after an unauthorized response",
        )?;
        registry.register(Box::new(requests_replayed.clone()))?;

        let requests_rejected = IntCounter::new(
            "session_requests_rejected_total",
            "Queued requests rejected because a refresh failed",
        )?;
        registry.register(Box::new(requests_rejected.clone()))?;

        Ok(Self {
            registry,
            login_attempts,
            refresh_attempts,
            requests_replayed,
            requests_rejected,
        })
    }

    pub fn login_attempt(&self, outcome: &str) {
        self.login_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn refresh_attempt(&self, trigger: &str, outcome: &str) {
        self.refresh_attempts
            .with_label_values(&[trigger, outcome])
            .inc();
    }

    pub fn request_replayed(&self) {
        self.requests_replayed.inc();
    }

    pub fn request_rejected(&self) {
        self.requests_rejected.inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
