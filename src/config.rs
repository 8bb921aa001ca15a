//! Client options and their validation.

use std::net::UdpSocket;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Username/password pair for servers with authentication enabled.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Tunables shared by both session kinds.
///
/// The timer fields default to the protocol's canonical values; they are
/// exposed so tests can run on short timers.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Reported to the server during connection setup.
    pub client_name: String,
    pub client_version: String,
    /// Namespace announced at setup time; individual descriptors still carry
    /// their own namespace.
    pub namespace: String,
    /// Local address reported to the server. Detected automatically when
    /// `None`.
    pub client_ip: Option<String>,
    pub credentials: Option<Credentials>,
    /// Spacing of keep-alive probes on an established stream.
    pub health_check_interval: Duration,
    /// Server-side wait budget for the long-poll listener endpoint.
    pub long_poll_timeout: Duration,
    /// Per-request ceiling for unary calls on either surface.
    pub request_timeout: Duration,
    /// Hard ceiling on `init()`.
    pub init_timeout: Duration,
    /// Delay between readiness probes on a fresh stream.
    pub probe_delay: Duration,
    /// Quiet period before the reconnect supervisor starts dialing.
    pub reconnect_grace: Duration,
    /// Pause after a transient inbound read error.
    pub read_retry_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            namespace: String::new(),
            client_ip: None,
            credentials: None,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            probe_delay: DEFAULT_PROBE_DELAY,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            read_retry_delay: DEFAULT_READ_RETRY_DELAY,
        }
    }
}

impl ClientOptions {
    /// Clamps out-of-range values back to their defaults, warning as it goes.
    pub fn sanitize(mut self) -> Self {
        if self.health_check_interval < MIN_HEALTH_CHECK_INTERVAL {
            warn!(
                configured = ?self.health_check_interval,
                minimum = ?MIN_HEALTH_CHECK_INTERVAL,
                "health check interval below minimum, using default"
            );
            self.health_check_interval = DEFAULT_HEALTH_CHECK_INTERVAL;
        }
        if self.long_poll_timeout.is_zero() {
            warn!("long poll timeout of zero is not usable, using default");
            self.long_poll_timeout = DEFAULT_LONG_POLL_TIMEOUT;
        }
        if self.request_timeout.is_zero() {
            warn!("request timeout of zero is not usable, using default");
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        if self.init_timeout.is_zero() {
            warn!("init timeout of zero is not usable, using default");
            self.init_timeout = DEFAULT_INIT_TIMEOUT;
        }
        self
    }

    /// The address reported to the server: configured value, or the source
    /// address the OS would use to reach the outside.
    pub fn resolved_client_ip(&self) -> String {
        if let Some(ip) = &self.client_ip {
            return ip.clone();
        }
        detect_local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
    }
}

/// Best-effort local address discovery via a connected (never written to)
/// UDP socket.
fn detect_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_health_interval() {
        let options = ClientOptions {
            health_check_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let options = options.sanitize();
        assert_eq!(options.health_check_interval, DEFAULT_HEALTH_CHECK_INTERVAL);
    }

    #[test]
    fn sanitize_keeps_valid_values() {
        let options = ClientOptions {
            health_check_interval: Duration::from_secs(2),
            long_poll_timeout: Duration::from_secs(15),
            ..Default::default()
        };
        let options = options.sanitize();
        assert_eq!(options.health_check_interval, Duration::from_secs(2));
        assert_eq!(options.long_poll_timeout, Duration::from_secs(15));
    }

    #[test]
    fn configured_client_ip_wins() {
        let options = ClientOptions {
            client_ip: Some("10.1.2.3".to_string()),
            ..Default::default()
        };
        assert_eq!(options.resolved_client_ip(), "10.1.2.3");
    }
}
