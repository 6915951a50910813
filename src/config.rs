use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::engine::EngineSettings;
use crate::limits::*;

/// Daemon configuration, read once from `ROOMSLOT_*` environment variables.
/// Unset or unparseable values fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_txn_ops: usize,
    pub chunk_retries: u32,
    pub retry_backoff: Duration,
    pub store_timeout: Duration,
    pub day_offset: FixedOffset,
    pub snapshot_interval: Duration,
    pub compact_threshold: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let data_dir = lookup("ROOMSLOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let snapshot_dir = lookup("ROOMSLOT_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("snapshots"));
        let day_offset = parsed::<i32>(&lookup, "ROOMSLOT_DAY_OFFSET_MINUTES")
            .filter(|m| m.abs() <= MAX_DAY_OFFSET_MINUTES)
            .and_then(|m| FixedOffset::east_opt(m * 60))
            .unwrap_or_else(|| Utc.fix());

        Self {
            metrics_port: parsed(&lookup, "ROOMSLOT_METRICS_PORT"),
            max_txn_ops: parsed::<usize>(&lookup, "ROOMSLOT_MAX_TXN_OPS")
                .filter(|n| (1..=MAX_OPS_PER_TRANSACTION).contains(n))
                .unwrap_or(MAX_OPS_PER_TRANSACTION),
            chunk_retries: parsed(&lookup, "ROOMSLOT_CHUNK_RETRIES").unwrap_or(DEFAULT_CHUNK_RETRIES),
            retry_backoff: Duration::from_millis(
                parsed(&lookup, "ROOMSLOT_RETRY_BACKOFF_MS").unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            store_timeout: Duration::from_millis(
                parsed::<u64>(&lookup, "ROOMSLOT_STORE_TIMEOUT_MS")
                    .filter(|ms| *ms > 0)
                    .unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
            day_offset,
            snapshot_interval: Duration::from_secs(
                parsed::<u64>(&lookup, "ROOMSLOT_SNAPSHOT_INTERVAL_SECS")
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_SNAPSHOT_INTERVAL_SECS),
            ),
            compact_threshold: parsed(&lookup, "ROOMSLOT_COMPACT_THRESHOLD")
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            data_dir,
            snapshot_dir,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomslot.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_chunk: self.max_txn_ops,
            chunk_retries: self.chunk_retries,
            retry_backoff: self.retry_backoff,
            store_timeout: self.store_timeout,
            day_offset: self.day_offset,
            ..EngineSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.snapshot_dir, PathBuf::from("./data").join("snapshots"));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.max_txn_ops, 500);
        assert_eq!(c.chunk_retries, 3);
        assert_eq!(c.retry_backoff, Duration::from_millis(50));
        assert_eq!(c.store_timeout, Duration::from_secs(5));
        assert_eq!(c.day_offset.local_minus_utc(), 0);
        assert_eq!(c.snapshot_interval, Duration::from_secs(3600));
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.wal_path(), PathBuf::from("./data").join("roomslot.wal"));
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("ROOMSLOT_DATA_DIR", "/var/lib/roomslot"),
            ("ROOMSLOT_METRICS_PORT", "9100"),
            ("ROOMSLOT_MAX_TXN_OPS", "200"),
            ("ROOMSLOT_DAY_OFFSET_MINUTES", "540"),
            ("ROOMSLOT_STORE_TIMEOUT_MS", "250"),
        ]);
        assert_eq!(c.snapshot_dir, PathBuf::from("/var/lib/roomslot/snapshots"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.max_txn_ops, 200);
        assert_eq!(c.day_offset.local_minus_utc(), 9 * 3600);

        let settings = c.engine_settings();
        assert_eq!(settings.max_chunk, 200);
        assert_eq!(settings.store_timeout, Duration::from_millis(250));
        assert_eq!(settings.snapshot_prefix, "snapshots");
    }

    #[test]
    fn bad_values_fall_back() {
        let c = config(&[
            ("ROOMSLOT_METRICS_PORT", "not-a-port"),
            ("ROOMSLOT_MAX_TXN_OPS", "5000"),
            ("ROOMSLOT_DAY_OFFSET_MINUTES", "100000"),
            ("ROOMSLOT_SNAPSHOT_INTERVAL_SECS", "0"),
            ("ROOMSLOT_CHUNK_RETRIES", "-1"),
        ]);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.max_txn_ops, 500);
        assert_eq!(c.day_offset.local_minus_utc(), 0);
        assert_eq!(c.snapshot_interval, Duration::from_secs(3600));
        assert_eq!(c.chunk_retries, 3);
    }
}
