use std::time::Duration;

/// Runtime configuration, read once at startup from the environment.
///
/// `api_url` and `api_key` stay optional here; `AgentClient::new` turns
/// their absence into a configuration error before any network call.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    /// Status-check budget for a chat send. The remote computation
    /// (batch scenario pricing) can legitimately run for minutes.
    pub poll_max_attempts: u32,
    pub poll_interval_ms: u64,
    /// Smaller budget for the thread-bootstrap path that only hydrates
    /// market views.
    pub bootstrap_max_attempts: u32,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            api_url: std::env::var("GRAPH_API_URL").ok(),
            api_key: std::env::var("GRAPH_API_KEY").ok(),
            assistant_id: std::env::var("GRAPH_ASSISTANT_ID").ok(),
            poll_max_attempts: std::env::var("POLL_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(120),
            poll_interval_ms: std::env::var("POLL_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(1000),
            bootstrap_max_attempts: std::env::var("BOOTSTRAP_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
