//! Endpoint configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Transport used for listening and dialing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// TCP over IPv4 or IPv6.
    #[default]
    Tcp,
    /// TCP over IPv4 only.
    Tcp4,
    /// TCP over IPv6 only.
    Tcp6,
    /// Unix domain sockets.
    Unix,
}

impl Network {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Unix => "unix",
        }
    }

    /// True for the TCP variants.
    #[must_use]
    pub const fn is_tcp(self) -> bool {
        !matches!(self, Self::Unix)
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "unix" => Ok(Self::Unix),
            other => Err(Error::Config(format!("unsupported network {other:?}"))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default interval between redial attempts.
pub const DEFAULT_REDIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Transport kind.
    pub network: Network,
    /// `host:port` for TCP, a filesystem path for Unix sockets.
    pub listen_addr: String,
    /// Name of the codec used when a call does not pick one.
    pub default_body_codec: String,
    /// Sessions close themselves once this old.
    pub default_session_age: Option<Duration>,
    /// Inbound handlers are cut off after this long.
    pub default_context_age: Option<Duration>,
    /// Calls and handlers slower than this are logged as warnings.
    pub slow_comet_duration: Duration,
    /// Log metadata and bodies of every message.
    pub print_detail: bool,
    /// Log the elapsed time of every exchange.
    pub count_time: bool,
    /// Connect timeout for dials.
    pub dial_timeout: Option<Duration>,
    /// Reconnect attempts after a client session loses its connection.
    pub redial_times: u32,
    /// Pause between reconnect attempts.
    pub redial_interval: Duration,
    /// Largest frame accepted or sent, in bytes.
    pub message_size_limit: u32,
    /// Recycled messages kept for reuse.
    pub message_pool_size: usize,
    /// Recycled sockets kept for reuse.
    pub socket_pool_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            listen_addr: "0.0.0.0:9090".to_string(),
            default_body_codec: "json".to_string(),
            default_session_age: None,
            default_context_age: None,
            slow_comet_duration: Duration::MAX,
            print_detail: false,
            count_time: false,
            dial_timeout: None,
            redial_times: 0,
            redial_interval: DEFAULT_REDIAL_INTERVAL,
            message_size_limit: u32::MAX,
            message_pool_size: 1024,
            socket_pool_size: 256,
        }
    }
}

impl EndpointConfig {
    /// Validate and normalise the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the listen address is unusable for the
    /// network kind.
    pub fn check(&mut self) -> Result<()> {
        self.listen_addr = self.listen_addr.trim().to_string();
        if self.listen_addr.is_empty() {
            return Err(Error::Config("listen address is empty".to_string()));
        }
        if self.network.is_tcp() && !self.listen_addr.contains(':') {
            return Err(Error::Config(format!(
                "listen address {:?} is not host:port",
                self.listen_addr
            )));
        }
        if self.default_body_codec.trim().is_empty() {
            self.default_body_codec = "json".to_string();
        }
        self.default_session_age = self.default_session_age.filter(|d| !d.is_zero());
        self.default_context_age = self.default_context_age.filter(|d| !d.is_zero());
        self.dial_timeout = self.dial_timeout.filter(|d| !d.is_zero());
        if self.slow_comet_duration.is_zero() {
            self.slow_comet_duration = Duration::MAX;
        }
        if self.redial_interval.is_zero() {
            self.redial_interval = DEFAULT_REDIAL_INTERVAL;
        }
        if self.message_size_limit == 0 {
            self.message_size_limit = u32::MAX;
        }
        Ok(())
    }
}
