//! Topology and per-proxy connection configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::buffer::DisconnectHandler;
use crate::cursor::CursorFactory;
use crate::error::{Error, Result};

/// TLS material handed through to the proxy transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsOptions {
    /// Certificate-authority bundle path.
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Client certificate path.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Client private-key path.
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Passphrase for the private key.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Reject connections whose certificate chain does not verify.
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
    /// Verify that the presented certificate matches the proxy hostname.
    #[serde(default = "default_true")]
    pub check_server_identity: bool,
}

/// Options applied to every proxy connection the topology creates.
///
/// These are forwarded verbatim to the [`ProxyFactory`](crate::proxy::ProxyFactory);
/// the topology itself only overrides the three membership flags at the
/// bottom when it builds handles.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionOptions {
    /// Connection pool size per proxy.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Enable TCP keepalive.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Initial TCP keepalive delay (milliseconds).
    #[serde(default = "default_keep_alive_initial_delay_ms")]
    pub keep_alive_initial_delay_ms: u64,
    /// Disable Nagle's algorithm.
    #[serde(default = "default_true")]
    pub no_delay: bool,
    /// TCP connect timeout (milliseconds).
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Socket read/write timeout (milliseconds).
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Promote 64-bit integers in replies to native longs.
    #[serde(default = "default_true")]
    pub promote_longs: bool,
    /// Serialize each wire message into a single buffer.
    #[serde(default = "default_true")]
    pub single_buffer_serialization: bool,
    /// TLS configuration; `None` means plain TCP.
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    /// Whether the connection reconnects on its own. The topology always
    /// sets this to `false` for handles it owns; rehab is its job.
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Whether the connection runs its own monitoring.
    #[serde(default = "default_true")]
    pub monitoring: bool,
    /// Whether the connection is owned by a topology.
    #[serde(default)]
    pub in_topology: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_pool_size() -> usize {
    5
}

const fn default_keep_alive_initial_delay_ms() -> u64 {
    300_000
}

const fn default_connection_timeout_ms() -> u64 {
    30_000
}

const fn default_socket_timeout_ms() -> u64 {
    360_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            keep_alive: true,
            keep_alive_initial_delay_ms: default_keep_alive_initial_delay_ms(),
            no_delay: true,
            connection_timeout_ms: default_connection_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            promote_longs: true,
            single_buffer_serialization: true,
            tls: None,
            reconnect: true,
            monitoring: true,
            in_topology: false,
        }
    }
}

impl ConnectionOptions {
    /// The variant of these options the topology hands to its own handles:
    /// no self-reconnect, no self-monitoring, topology-owned.
    pub(crate) fn for_topology_member(&self) -> Self {
        Self {
            reconnect: false,
            monitoring: false,
            in_topology: true,
            ..self.clone()
        }
    }
}

/// Authentication mechanisms known to the driver by default.
pub const DEFAULT_AUTH_PROVIDERS: &[&str] = &[
    "mongocr",
    "x509",
    "plain",
    "gssapi",
    "sspi",
    "scram-sha-1",
    "scram-sha-256",
];

/// Topology-level configuration.
///
/// All durations are carried as milliseconds to match the wire-level option
/// names; the accessor methods convert to [`Duration`].
#[derive(Clone)]
pub struct TopologyConfig {
    /// High-availability monitor interval (milliseconds).
    pub ha_interval_ms: u64,
    /// Width of the latency eligibility window (milliseconds).
    pub local_threshold_ms: Option<u64>,
    /// Legacy synonym for `local_threshold_ms`, consulted when it is unset.
    pub acceptable_latency_ms: Option<u64>,
    /// Options for the proxy connections the topology creates.
    pub connection: ConnectionOptions,
    /// Registered authentication mechanisms.
    pub auth_providers: Vec<String>,
    /// Emit `PickedServer` events from `get_server`.
    pub debug: bool,
    /// Re-emit proxy probe failures as topology `Error` events.
    pub emit_error: bool,
    /// Emit an `Error` event when a monitor tick finds no proxies and the
    /// rehabilitation pass promotes none. Off by default: the stock behavior
    /// is to keep retrying silently.
    pub fatal_when_unavailable: bool,
    /// Lower the latency floor from the freshly measured probe round-trip
    /// instead of the handle's previous sample. Off by default.
    pub min_latency_uses_fresh_sample: bool,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// Factory for cursors built by [`Mongos::cursor`](crate::Mongos::cursor)
    /// when the per-call options carry none.
    pub cursor_factory: Option<Arc<dyn CursorFactory>>,
    /// Optional buffer that receives operations submitted while offline.
    pub disconnect_handler: Option<Arc<dyn DisconnectHandler>>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            ha_interval_ms: 10_000,
            local_threshold_ms: None,
            acceptable_latency_ms: None,
            connection: ConnectionOptions::default(),
            auth_providers: DEFAULT_AUTH_PROVIDERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            debug: false,
            emit_error: false,
            fatal_when_unavailable: false,
            min_latency_uses_fresh_sample: false,
            event_capacity: 512,
            cursor_factory: None,
            disconnect_handler: None,
        }
    }
}

impl TopologyConfig {
    /// Monitor interval as a [`Duration`].
    #[must_use]
    pub fn ha_interval(&self) -> Duration {
        Duration::from_millis(self.ha_interval_ms)
    }

    /// Effective eligibility-window width: `local_threshold_ms`, falling back
    /// to the legacy `acceptable_latency_ms`, falling back to 15 ms.
    #[must_use]
    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(
            self.local_threshold_ms
                .or(self.acceptable_latency_ms)
                .unwrap_or(15),
        )
    }

    /// Return `true` if `mechanism` may be used for authentication.
    ///
    /// `"default"` is always accepted; everything else must be registered in
    /// `auth_providers`.
    #[must_use]
    pub fn supports_mechanism(&self, mechanism: &str) -> bool {
        mechanism == "default" || self.auth_providers.iter().any(|m| m == mechanism)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &'static str, reason: &str| Error::Config {
            field,
            reason: reason.to_string(),
        };

        if self.ha_interval_ms == 0 {
            return Err(invalid("ha_interval_ms", "must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be > 0"));
        }
        if self.connection.size == 0 {
            return Err(invalid("connection.size", "must be > 0"));
        }
        if self.connection.connection_timeout_ms == 0 {
            return Err(invalid("connection.connection_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Debug for TopologyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyConfig")
            .field("ha_interval_ms", &self.ha_interval_ms)
            .field("local_threshold_ms", &self.local_threshold_ms)
            .field("acceptable_latency_ms", &self.acceptable_latency_ms)
            .field("connection", &self.connection)
            .field("auth_providers", &self.auth_providers)
            .field("debug", &self.debug)
            .field("emit_error", &self.emit_error)
            .field("fatal_when_unavailable", &self.fatal_when_unavailable)
            .field(
                "min_latency_uses_fresh_sample",
                &self.min_latency_uses_fresh_sample,
            )
            .field("event_capacity", &self.event_capacity)
            .field("cursor_factory", &self.cursor_factory.is_some())
            .field("disconnect_handler", &self.disconnect_handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TopologyConfig::default();
        assert_eq!(config.ha_interval(), Duration::from_secs(10));
        assert_eq!(config.local_threshold(), Duration::from_millis(15));
        assert_eq!(config.connection.size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn acceptable_latency_is_a_fallback() {
        let config = TopologyConfig {
            acceptable_latency_ms: Some(42),
            ..Default::default()
        };
        assert_eq!(config.local_threshold(), Duration::from_millis(42));

        let config = TopologyConfig {
            local_threshold_ms: Some(7),
            acceptable_latency_ms: Some(42),
            ..Default::default()
        };
        assert_eq!(config.local_threshold(), Duration::from_millis(7));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = TopologyConfig {
            ha_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ha_interval_ms"));
    }

    #[test]
    fn default_mechanism_is_always_supported() {
        let config = TopologyConfig {
            auth_providers: vec![],
            ..Default::default()
        };
        assert!(config.supports_mechanism("default"));
        assert!(!config.supports_mechanism("scram-sha-1"));
    }

    #[test]
    fn member_options_force_topology_flags() {
        let options = ConnectionOptions::default().for_topology_member();
        assert!(!options.reconnect);
        assert!(!options.monitoring);
        assert!(options.in_topology);
        assert_eq!(options.size, 5);
    }
}
