#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use url::Url;

use crate::backoff::{BackoffStrategy, Exponential};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_BASE_URL: &str = "http://localhost/";

/// What happens after the heartbeat window expires without a record.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeartbeatPolicy {
    /// Close the client for good
    #[default]
    Close,
    /// Treat the silence like a lost connection and reconnect (when reconnection is enabled)
    Reconnect,
}

/// Configuration for push client behavior.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use pushstream_client::push::config::{Config, HeartbeatPolicy, ReconnectConfig};
///
/// let config = Config::builder()
///     .heartbeat_timeout(Duration::from_secs(45))
///     .heartbeat_policy(HeartbeatPolicy::Reconnect)
///     .reconnect(ReconnectConfig::builder().max_attempts(10).build())
///     .build();
///
/// assert!(config.parse_json);
/// assert_eq!(config.reconnect.max_attempts, 10);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Declare the connection dead when no record arrives for this long
    pub heartbeat_timeout: Option<Duration>,
    #[builder(default)]
    pub heartbeat_policy: HeartbeatPolicy,
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Decode record bodies as JSON, falling back to the raw text
    #[builder(default = true)]
    pub parse_json: bool,
    #[builder(default)]
    pub with_credentials: bool,
    #[builder(default)]
    pub headers: BTreeMap<String, String>,
    /// Fail a connection attempt that neither opens nor errors within this window
    pub connection_timeout: Option<Duration>,
    /// Whether [`Client::open`](crate::push::Client::open) waits for the first connection
    #[builder(default = true)]
    pub wait_for_connection: bool,
    /// Base for relative endpoints. Defaults to `http://localhost/`.
    pub base_url: Option<Url>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    pub(crate) fn base_url(&self) -> crate::Result<Url> {
        match &self.base_url {
            Some(url) => Ok(url.clone()),
            None => Ok(Url::parse(DEFAULT_BASE_URL)?),
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct ReconnectConfig {
    #[builder(default = true)]
    pub enabled: bool,
    /// Reconnection attempts allowed after a connection is lost
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    #[builder(default = DEFAULT_INITIAL_DELAY)]
    pub initial_delay: Duration,
    /// Cap applied by the default exponential strategy
    #[builder(default = DEFAULT_MAX_DELAY)]
    pub max_delay: Duration,
    /// Delay strategy. Defaults to [`Exponential`] from `initial_delay` and `max_delay`.
    pub strategy: Option<Arc<dyn BackoffStrategy>>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfig {
    /// Reconnection switched off.
    #[must_use]
    pub fn disabled() -> Self {
        Self::builder().enabled(false).build()
    }

    /// The configured strategy, or the default exponential one.
    #[must_use]
    pub fn resolved_strategy(&self) -> Arc<dyn BackoffStrategy> {
        match &self.strategy {
            Some(strategy) => Arc::clone(strategy),
            None => Arc::new(Exponential::new(self.initial_delay, self.max_delay)),
        }
    }
}

impl fmt::Debug for ReconnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectConfig")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("custom_strategy", &self.strategy.is_some())
            .finish()
    }
}
