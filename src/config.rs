use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TXN_DEADLINE};

/// Process configuration, read once at startup from `STATIOND_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub pools_path: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub txn_deadline: Duration,
    pub txn_max_attempts: u32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());

        let deadline_ms: u64 = parse(&lookup, "STATIOND_TXN_DEADLINE_MS")?
            .unwrap_or(DEFAULT_TXN_DEADLINE.as_millis() as u64);

        Ok(Self {
            port: parse(&lookup, "STATIOND_PORT")?.unwrap_or(5434),
            bind: text("STATIOND_BIND", "0.0.0.0"),
            data_dir: text("STATIOND_DATA_DIR", "./data").into(),
            pools_path: text("STATIOND_POOLS", "./pools.json").into(),
            password: text("STATIOND_PASSWORD", "stationd"),
            max_connections: parse(&lookup, "STATIOND_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse(&lookup, "STATIOND_COMPACT_THRESHOLD")?.unwrap_or(1000),
            txn_deadline: Duration::from_millis(deadline_ms),
            txn_max_attempts: parse(&lookup, "STATIOND_TXN_MAX_ATTEMPTS")?
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            metrics_port: parse(&lookup, "STATIOND_METRICS_PORT")?,
            tls_cert: lookup("STATIOND_TLS_CERT"),
            tls_key: lookup("STATIOND_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

/// Unset is `None`; set but unparseable is an error, never the default.
fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}
