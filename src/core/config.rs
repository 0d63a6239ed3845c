use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use super::error::{ClientError, ClientResult};
use crate::transport::{CookieJar, WsDialer};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
pub const DEFAULT_PRIVATE_CHANNEL_PREFIX: &str = "$";

/// Maximum number of consecutive failed connection attempts, 0 means reconnect forever.
pub const DEFAULT_BACKOFF_NUM_RECONNECT: u32 = 0;
pub const DEFAULT_BACKOFF_MIN_MILLISECONDS: u64 = 100;
pub const DEFAULT_BACKOFF_MAX_MILLISECONDS: u64 = 20 * 1000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_BACKOFF_JITTER: bool = true;

/// Exponential backoff parameters for the reconnect loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffReconnectConfig {
    /// Maximum number of consecutive failed connection attempts, 0 means reconnect forever.
    pub num_reconnect: u32,
    /// Multiplying factor for each increment step.
    pub factor: f64,
    /// Randomize each delay within `[min_milliseconds, computed delay]`.
    pub jitter: bool,
    pub min_milliseconds: u64,
    pub max_milliseconds: u64,
}

impl Default for BackoffReconnectConfig {
    fn default() -> Self {
        Self {
            num_reconnect: DEFAULT_BACKOFF_NUM_RECONNECT,
            factor: DEFAULT_BACKOFF_FACTOR,
            jitter: DEFAULT_BACKOFF_JITTER,
            min_milliseconds: DEFAULT_BACKOFF_MIN_MILLISECONDS,
            max_milliseconds: DEFAULT_BACKOFF_MAX_MILLISECONDS,
        }
    }
}

impl BackoffReconnectConfig {
    pub fn validate(&self) -> ClientResult<()> {
        if self.min_milliseconds > self.max_milliseconds {
            return Err(ClientError::InvalidConfig(format!(
                "backoff min {}ms exceeds max {}ms",
                self.min_milliseconds, self.max_milliseconds
            )));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ClientError::InvalidConfig(format!(
                "backoff factor must be a finite value >= 1, got {}",
                self.factor
            )));
        }
        Ok(())
    }
}

/// Connection-level options.
///
/// Transport pass-through settings (dialer, TLS, cookie jar, headers) are handed to the
/// transport unmodified at dial time.
#[derive(Clone)]
pub struct WsConfig {
    /// Custom TCP dialer. When `None`, the transport resolves and connects on its own.
    pub dialer: Option<WsDialer>,
    pub private_channel_prefix: String,
    /// Per-read deadline; silence beyond it tears the session down.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    /// Deadline covering dial, websocket upgrade and the connect reply.
    pub handshake_timeout: Duration,
    /// TLS configuration used for `wss://` URLs. When `None`, webpki roots are used.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// When `None`, cookies are not sent in requests and ignored in responses.
    pub cookie_jar: Option<Arc<dyn CookieJar>>,
    pub header: HeaderMap,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            dialer: None,
            private_channel_prefix: DEFAULT_PRIVATE_CHANNEL_PREFIX.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls: None,
            cookie_jar: None,
            header: HeaderMap::new(),
        }
    }
}

impl fmt::Debug for WsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConfig")
            .field("dialer", &self.dialer.is_some())
            .field("private_channel_prefix", &self.private_channel_prefix)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tls", &self.tls.is_some())
            .field("cookie_jar", &self.cookie_jar.is_some())
            .field("header", &self.header)
            .finish()
    }
}

impl WsConfig {
    pub fn validate(&self) -> ClientResult<()> {
        let timeouts = [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("ping_interval", self.ping_interval),
            ("handshake_timeout", self.handshake_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ClientError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Whether `channel` needs a token from the token provider before subscribing.
    #[inline]
    pub fn is_private_channel(&self, channel: &str) -> bool {
        !self.private_channel_prefix.is_empty() && channel.starts_with(&self.private_channel_prefix)
    }
}

/// Complete client configuration, supplied once at construction.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub backoff: BackoffReconnectConfig,
    pub ws: WsConfig,
}

impl Config {
    pub fn validate(&self) -> ClientResult<()> {
        self.backoff.validate()?;
        self.ws.validate()
    }

    pub fn with_backoff(mut self, backoff: BackoffReconnectConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeouts(mut self, handshake: Duration, read: Duration, write: Duration) -> Self {
        self.ws.handshake_timeout = handshake;
        self.ws.read_timeout = read;
        self.ws.write_timeout = write;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ws.ping_interval = interval;
        self
    }

    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.ws.header.insert(name, value);
        self
    }

    pub fn with_cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.ws.cookie_jar = Some(jar);
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.ws.tls = Some(tls);
        self
    }

    pub fn with_dialer(mut self, dialer: WsDialer) -> Self {
        self.ws.dialer = Some(dialer);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.ws.handshake_timeout, Duration::from_secs(1));
        assert_eq!(cfg.ws.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.ws.write_timeout, Duration::from_secs(1));
        assert_eq!(cfg.ws.ping_interval, Duration::from_secs(25));
        assert_eq!(cfg.ws.private_channel_prefix, "$");
        assert_eq!(cfg.backoff.num_reconnect, 0);
        assert_eq!(cfg.backoff.min_milliseconds, 100);
        assert_eq!(cfg.backoff.max_milliseconds, 20_000);
        assert_eq!(cfg.backoff.factor, 2.0);
        assert!(cfg.backoff.jitter);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_backoff_bounds_and_small_factor() {
        let mut cfg = Config::default();
        cfg.backoff.min_milliseconds = 500;
        cfg.backoff.max_milliseconds = 100;
        assert!(matches!(cfg.validate(), Err(ClientError::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.backoff.factor = 0.5;
        assert!(matches!(cfg.validate(), Err(ClientError::InvalidConfig(_))));

        cfg.backoff.factor = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_ping_interval() {
        let cfg = Config::default().with_ping_interval(Duration::ZERO);
        match cfg.validate() {
            Err(ClientError::InvalidConfig(msg)) => assert!(msg.contains("ping_interval")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn private_channel_detection_uses_prefix() {
        let mut ws = WsConfig::default();
        assert!(ws.is_private_channel("$secret"));
        assert!(!ws.is_private_channel("public"));

        ws.private_channel_prefix.clear();
        assert!(!ws.is_private_channel("$secret"));
    }
}
