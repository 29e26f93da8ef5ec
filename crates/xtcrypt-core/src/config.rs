//! Session configuration.
//!
//! Defaults suit storage nodes reached over a wide-area network. Use
//! [`SessionConfig::local()`] when the nodes are on the same host or LAN.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default margin before expiry at which a capability is renewed inline.
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(30);

/// Default period of the background renewal task.
pub const DEFAULT_RENEWAL_PERIOD: Duration = Duration::from_secs(60);

/// Default bound on one storage call.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on one renewal exchange.
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning knobs of a [`FileSession`](crate::FileSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A capability is renewed before use once `now + margin >= expiry`.
    ///
    /// Default: 30 seconds.
    #[serde(with = "humantime_serde")]
    pub renewal_margin: Duration,

    /// Period of the background renewal task, `None` to disable it.
    ///
    /// Default: 60 seconds.
    #[serde(with = "humantime_serde")]
    pub renewal_period: Option<Duration>,

    /// Timeout for one storage call. An expired call counts as a
    /// communication failure and triggers failover.
    ///
    /// Default: 30 seconds (network) or 5 seconds (local).
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Timeout for one renewal exchange with the authority.
    #[serde(with = "humantime_serde")]
    pub renewal_timeout: Duration,

    /// Notify the other replicas after a session that wrote data closes.
    pub notify_replicas_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            renewal_period: Some(DEFAULT_RENEWAL_PERIOD),
            io_timeout: DEFAULT_IO_TIMEOUT,
            renewal_timeout: DEFAULT_RENEWAL_TIMEOUT,
            notify_replicas_on_close: true,
        }
    }
}

impl SessionConfig {
    /// Configuration for nearby storage nodes, with short timeouts.
    pub fn local() -> Self {
        Self {
            io_timeout: Duration::from_secs(5),
            renewal_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = margin;
        self
    }

    #[must_use]
    pub fn renewal_period(mut self, period: Option<Duration>) -> Self {
        self.renewal_period = period;
        self
    }

    #[must_use]
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub fn renewal_timeout(mut self, timeout: Duration) -> Self {
        self.renewal_timeout = timeout;
        self
    }

    #[must_use]
    pub fn notify_replicas_on_close(mut self, notify: bool) -> Self {
        self.notify_replicas_on_close = notify;
        self
    }
}
