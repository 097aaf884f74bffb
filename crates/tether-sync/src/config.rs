use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::SyncError;

/// Keepalive interval: a protocol-level ping every 30 seconds.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_SYNC_URL: &str = "ws://localhost:3000/v1/updates";

/// Capacity of each broadcast event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// How long `disconnect()` waits for the transport to close cleanly.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// A control write that takes longer than this fails and drops the connection.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Exponential backoff for reconnection.
///
/// delay(attempt) = min(base_delay * multiplier^attempt, max_delay)
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the reconnection that follows `attempt` earlier failures.
    /// Multipliers below 1 are treated as 1 so delays never shrink.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * factor;
        // f64::min ignores NaN, so an overflowing product lands on the cap
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// True once `attempt` has gone past the configured limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the update socket. `http(s)` is mapped to `ws(s)`.
    pub server_url: Url,
    pub reconnect: ReconnectPolicy,
    pub ping_interval: Duration,
    pub event_buffer: usize,
    pub close_timeout: Duration,
    pub send_timeout: Duration,
}

impl SyncConfig {
    pub fn new(server_url: Url) -> Self {
        Self {
            server_url,
            reconnect: ReconnectPolicy::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Read configuration from `TETHER_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, SyncError> {
        let raw_url = std::env::var("TETHER_SYNC_URL").unwrap_or_else(|_| DEFAULT_SYNC_URL.into());
        let server_url = Url::parse(&raw_url)
            .map_err(|e| SyncError::Config(format!("TETHER_SYNC_URL: {}", e)))?;

        let mut config = Self::new(server_url);

        if let Some(secs) = env_parse::<u64>("TETHER_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TETHER_SEND_TIMEOUT_SECS")? {
            config.send_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse::<bool>("TETHER_RECONNECT_ENABLED")? {
            config.reconnect.enabled = enabled;
        }
        if let Some(ms) = env_parse::<u64>("TETHER_RECONNECT_BASE_MS")? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("TETHER_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = env_parse::<f64>("TETHER_RECONNECT_MULTIPLIER")? {
            config.reconnect.multiplier = multiplier;
        }
        if let Some(attempts) = env_parse::<u32>("TETHER_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.ping_interval.is_zero() {
            return Err(SyncError::Config("ping interval must be non-zero".into()));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(SyncError::Config(format!(
                "reconnect multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if self.send_timeout.is_zero() {
            return Err(SyncError::Config("send timeout must be non-zero".into()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event buffer must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, SyncError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Build the socket URL: the base URL with the bearer token attached as the
/// `token` query parameter. The socket upgrade carries no custom headers.
pub fn transport_url(base: &Url, token: &str) -> Result<Url, SyncError> {
    let mut url = base.clone();

    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::Config(format!(
                "unsupported sync url scheme: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot use scheme {} for {}", scheme, base)))?;

    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(name, _)| name != "token")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("token", token);

    Ok(url)
}
