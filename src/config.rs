use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::primitives::NodeId;
use crate::retry::policy::ExponentialBackOff;

/// How a node derives its neighbours from a topology message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TopologyStrategy {
    /// Use the neighbours the controller hands out.
    Provided,
    /// The leader neighbours every node, followers neighbour nobody and only
    /// forward to the leader.
    Star,
}

impl FromStr for TopologyStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provided" => Ok(TopologyStrategy::Provided),
            "star" => Ok(TopologyStrategy::Star),
            _ => Err(()),
        }
    }
}

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// How often pending batches are flushed to peers
    pub flush_interval: Duration,
    /// How long a single delivery attempt waits for a reply
    pub rpc_timeout: Duration,
    pub backoff: ExponentialBackOff,
    pub topology: TopologyStrategy,
    /// Explicit leader; the lowest node id of the cluster otherwise
    pub leader: Option<NodeId>,
    /// Write logs to hourly rolling files in this directory instead of stderr
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(200),
            rpc_timeout: Duration::from_secs(1),
            backoff: ExponentialBackOff::default(),
            topology: TopologyStrategy::Provided,
            leader: None,
            log_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything that is not set.
    ///
    /// Recognised variables:
    /// - `BROADCAST_FLUSH_INTERVAL_MS`
    /// - `BROADCAST_RPC_TIMEOUT_MS`
    /// - `BROADCAST_BACKOFF_BASE_MS`, `BROADCAST_BACKOFF_MAX_MS`, `BROADCAST_JITTER_MS`
    /// - `BROADCAST_TOPOLOGY` (`provided` or `star`)
    /// - `BROADCAST_LEADER`
    /// - `BROADCAST_LOG_DIR`
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse_or(&lookup, name, default.as_millis() as u64).map(Duration::from_millis)
        };
        // Timers and timeouts must fire after some time has passed.
        let nonzero_millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            let period = millis(name, default)?;
            if period.is_zero() {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: lookup(name).unwrap_or_default(),
                });
            }
            Ok(period)
        };
        let default_backoff = defaults.backoff;

        Ok(Self {
            flush_interval: nonzero_millis("BROADCAST_FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            rpc_timeout: nonzero_millis("BROADCAST_RPC_TIMEOUT_MS", defaults.rpc_timeout)?,
            backoff: ExponentialBackOff::new(
                millis("BROADCAST_BACKOFF_BASE_MS", default_backoff.base())?,
                millis("BROADCAST_BACKOFF_MAX_MS", default_backoff.max())?,
                millis("BROADCAST_JITTER_MS", default_backoff.max_jitter())?,
            ),
            topology: parse_or(&lookup, "BROADCAST_TOPOLOGY", defaults.topology)?,
            leader: lookup("BROADCAST_LEADER")
                .filter(|leader| !leader.is_empty())
                .map(NodeId::from),
            log_dir: lookup("BROADCAST_LOG_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
