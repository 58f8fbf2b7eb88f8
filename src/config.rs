//! # Relay configuration.
//!
//! [`RelayConfig`] gathers every knob of the pipeline. All fields are public;
//! `Default` gives a working local setup and [`RelayConfig::from_env`] fills the
//! deployment-specific parts from the environment.
//!
//! ## Sentinel values
//! - `ListenerConfig::max_retry_duration = 0s` → reconnect forever
//! - `ReconcileConfig::reconcile_interval = 0s` → no periodic reconciliation
//! - `OutboxConfig::ttl = 0s` → entries are only purged once acknowledged
//! - `OutboxConfig::max_entries = 0` → unbounded outbox
//! - `DispatchConfig::ack_timeout = 0s` → wait for external acks forever
//!
//! ## Example
//! ```
//! use std::time::Duration;
//! use orders_relay::{InitialSync, RelayConfig};
//!
//! let mut cfg = RelayConfig::default();
//! cfg.database_url = "postgres://localhost/shop".into();
//! cfg.outbox.ttl = Duration::from_secs(3600);
//! cfg.reconcile.initial_sync = InitialSync::SeedOnly;
//!
//! assert_eq!(cfg.listener.channel, "order_changes");
//! assert_eq!(cfg.outbox.retention_ttl(), Some(Duration::from_secs(3600)));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::RelayError;
use crate::policies::BackoffPolicy;

/// Notification channel the triggers publish on.
pub const DEFAULT_CHANNEL: &str = "order_changes";
/// Source table.
pub const DEFAULT_TABLE: &str = "orders";

/// Configuration of the notification listener.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// `LISTEN` channel name.
    pub channel: String,
    /// Reconnect schedule (base 1s, cap 30s, full jitter).
    pub reconnect: BackoffPolicy,
    /// Give up and report `ListenerUnavailable` after reconnecting this long.
    ///
    /// `Duration::ZERO` = never give up.
    pub max_retry_duration: Duration,
    /// Capacity of the listener → detector channel.
    ///
    /// When full, payloads are dropped and counted; the detector reconciles.
    pub buffer: usize,
}

impl ListenerConfig {
    /// Returns the retry limit as an `Option` (`None` = unlimited).
    #[inline]
    pub fn retry_limit(&self) -> Option<Duration> {
        if self.max_retry_duration == Duration::ZERO {
            None
        } else {
            Some(self.max_retry_duration)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            reconnect: BackoffPolicy::reconnect(),
            max_retry_duration: Duration::from_secs(300),
            buffer: 1024,
        }
    }
}

/// What the detector does when no table cursor has been persisted yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InitialSync {
    /// Emit a synthetic Insert for every existing row.
    #[default]
    Snapshot,
    /// Remember the existing rows without emitting anything.
    SeedOnly,
}

/// Configuration of the gap detector and reconciler.
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// Startup behavior on an empty store.
    pub initial_sync: InitialSync,
    /// Rows with `updated_at` up to this much older than the watermark are re-read.
    ///
    /// Covers commits that land with an older timestamp than rows already seen.
    pub watermark_lag: Duration,
    /// Periodic reconciliation (`0s` = disabled).
    pub reconcile_interval: Duration,
    /// Live payloads buffered while a reconciliation query runs.
    ///
    /// Past this limit the listener channel is left to fill and overflow.
    pub held_limit: usize,
    /// Retry schedule for failed snapshot queries and outbox commits.
    pub retry: BackoffPolicy,
}

impl ReconcileConfig {
    /// Returns the periodic reconciliation interval (`None` = disabled).
    #[inline]
    pub fn interval(&self) -> Option<Duration> {
        if self.reconcile_interval == Duration::ZERO {
            None
        } else {
            Some(self.reconcile_interval)
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            initial_sync: InitialSync::default(),
            watermark_lag: Duration::from_secs(300),
            reconcile_interval: Duration::ZERO,
            held_limit: 4096,
            retry: BackoffPolicy::reconnect(),
        }
    }
}

/// Configuration of the durable outbox.
#[derive(Clone, Debug)]
pub struct OutboxConfig {
    /// Retention horizon for unacknowledged entries (`0s` = keep until acked).
    pub ttl: Duration,
    /// Maximum retained entries (`0` = unbounded).
    pub max_entries: u64,
    /// How often the retention task runs.
    pub purge_interval: Duration,
    /// Entries fetched per read transaction by `read_from`.
    pub page_size: usize,
}

impl OutboxConfig {
    /// Returns the TTL as an `Option` (`None` = no time-based purge).
    #[inline]
    pub fn retention_ttl(&self) -> Option<Duration> {
        if self.ttl == Duration::ZERO {
            None
        } else {
            Some(self.ttl)
        }
    }

    /// Returns the capacity as an `Option` (`None` = unbounded).
    #[inline]
    pub fn capacity(&self) -> Option<u64> {
        if self.max_entries == 0 {
            None
        } else {
            Some(self.max_entries)
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
            max_entries: 1_000_000,
            purge_interval: Duration::from_secs(60),
            page_size: 256,
        }
    }
}

/// Configuration of the fan-out dispatcher.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Redelivery schedule (base 250ms, cap 1min, unbounded retries).
    pub backoff: BackoffPolicy,
    /// How long an `AwaitingAck` delivery may stay unacknowledged.
    ///
    /// `Duration::ZERO` = wait forever.
    pub ack_timeout: Duration,
    /// Capacity of a pull subscription's channel.
    pub subscription_buffer: usize,
}

impl DispatchConfig {
    /// Returns the ack timeout as an `Option` (`None` = no timeout).
    #[inline]
    pub fn ack_deadline(&self) -> Option<Duration> {
        if self.ack_timeout == Duration::ZERO {
            None
        } else {
            Some(self.ack_timeout)
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::delivery(),
            ack_timeout: Duration::from_secs(30),
            subscription_buffer: 64,
        }
    }
}

/// Top-level relay configuration.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Connection string for both the listener and reconciliation queries.
    pub database_url: String,
    /// Source table name (plain identifier).
    pub table: String,
    /// Directory holding the outbox database file.
    pub data_dir: PathBuf,
    /// Maximum wait for tasks to stop before aborting them.
    pub grace: Duration,
    /// Capacity of the runtime event bus (min 1; clamped by `Bus`).
    pub bus_capacity: usize,
    pub listener: ListenerConfig,
    pub reconcile: ReconcileConfig,
    pub outbox: OutboxConfig,
    pub dispatch: DispatchConfig,
}

impl RelayConfig {
    /// File name of the outbox database inside `data_dir`.
    pub const OUTBOX_FILE: &'static str = "outbox.redb";

    /// Reads `DATABASE_URL` (required), `RELAY_CHANNEL`, `RELAY_TABLE` and
    /// `RELAY_DATA_DIR` on top of the defaults.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        cfg.database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| RelayError::Config {
                reason: "DATABASE_URL is not set".into(),
            })?;
        if let Some(channel) = lookup("RELAY_CHANNEL").filter(|v| !v.is_empty()) {
            cfg.listener.channel = channel;
        }
        if let Some(table) = lookup("RELAY_TABLE").filter(|v| !v.is_empty()) {
            cfg.table = table;
        }
        if let Some(dir) = lookup("RELAY_DATA_DIR").filter(|v| !v.is_empty()) {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects names that cannot be used as SQL identifiers.
    pub fn validate(&self) -> Result<(), RelayError> {
        for (what, name) in [("table", &self.table), ("channel", &self.listener.channel)] {
            if !is_identifier(name) {
                return Err(RelayError::Config {
                    reason: format!("{what} {name:?} is not a plain identifier"),
                });
            }
        }
        Ok(())
    }

    /// Full path of the outbox database file.
    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join(Self::OUTBOX_FILE)
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for RelayConfig {
    /// Defaults:
    /// - `table = "orders"`, `channel = "order_changes"`
    /// - `data_dir = "./relay-data"`
    /// - `grace = 30s`, `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            database_url: String::new(),
            table: DEFAULT_TABLE.to_string(),
            data_dir: PathBuf::from("./relay-data"),
            grace: Duration::from_secs(30),
            bus_capacity: 1024,
            listener: ListenerConfig::default(),
            reconcile: ReconcileConfig::default(),
            outbox: OutboxConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_database_url_required() {
        let err = RelayConfig::from_lookup(env(&[])).unwrap_err();
        assert_eq!(err.as_label(), "relay_config");
    }

    #[test]
    fn test_env_overrides_defaults() {
        let cfg = RelayConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://db/shop"),
            ("RELAY_CHANNEL", "changes"),
            ("RELAY_DATA_DIR", "/var/lib/relay"),
        ]))
        .unwrap();
        assert_eq!(cfg.listener.channel, "changes");
        assert_eq!(cfg.table, "orders");
        assert_eq!(cfg.outbox_path(), PathBuf::from("/var/lib/relay/outbox.redb"));
    }

    #[test]
    fn test_rejects_non_identifier_table() {
        let err = RelayConfig::from_lookup(env(&[
            ("DATABASE_URL", "postgres://db/shop"),
            ("RELAY_TABLE", "orders; drop table x"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
    }

    #[test]
    fn test_sentinels() {
        let mut cfg = RelayConfig::default();
        assert_eq!(cfg.listener.retry_limit(), Some(Duration::from_secs(300)));
        cfg.listener.max_retry_duration = Duration::ZERO;
        cfg.outbox.max_entries = 0;
        cfg.dispatch.ack_timeout = Duration::ZERO;
        assert_eq!(cfg.listener.retry_limit(), None);
        assert_eq!(cfg.outbox.capacity(), None);
        assert_eq!(cfg.dispatch.ack_deadline(), None);
        assert_eq!(cfg.reconcile.interval(), None);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("order_changes"));
        assert!(is_identifier("_t1"));
        assert!(!is_identifier("1orders"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}
