use std::time::Duration;

use url::Url;

/// Reconnection backoff constants: `delay = min(base * growth^n, max)` where
/// `n` counts consecutive closes since the last successful open.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub growth: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            growth: 1.5,
            max: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Websocket endpoint, e.g. `ws://127.0.0.1:8080/chat`.
    pub server_url: String,
    pub backoff: BackoffConfig,
    /// Shaping budget for outgoing images, measured on the encoded
    /// data-URI text length.
    pub image_budget_bytes: usize,
    /// Seen-id window: prune to `seen_retain` once `seen_cap` is exceeded.
    pub seen_cap: usize,
    pub seen_retain: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/chat".into(),
            backoff: BackoffConfig::default(),
            image_budget_bytes: 195 * 1024,
            seen_cap: 300,
            seen_retain: 150,
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
            config.server_url = v;
        }
        config
    }

    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        Url::parse(&self.server_url)
    }
}
