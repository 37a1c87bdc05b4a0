use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveTime;
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use thiserror::Error;

use crate::auth::Credentials;
use crate::engine::Schedule;
use crate::limits::MAX_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: bad time {value:?}, expected HH:MM")]
    BadTime { var: &'static str, value: String },
    #[error("{var}: bad window {value:?}, expected HH:MM-HH:MM or none")]
    BadWindow { var: &'static str, value: String },
    #[error("invalid schedule: {0}")]
    Schedule(&'static str),
    #[error("both BAYSLOT_TLS_CERT and BAYSLOT_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("tls: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Server settings, read from `BAYSLOT_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub credentials: Credentials,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub schedule: Schedule,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to their
    /// defaults; bad times and inconsistent schedules are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let defaults = Schedule::default();
        let time = |var: &'static str, default: NaiveTime| match lookup(var) {
            None => Ok(default),
            Some(value) => parse_time(&value).ok_or(ConfigError::BadTime { var, value }),
        };
        let break_window = match lookup("BAYSLOT_BREAK") {
            None => defaults.break_window,
            Some(value) => parse_window(&value).ok_or(ConfigError::BadWindow {
                var: "BAYSLOT_BREAK",
                value,
            })?,
        };
        let schedule = Schedule {
            open: time("BAYSLOT_OPEN", defaults.open)?,
            close: time("BAYSLOT_CLOSE", defaults.close)?,
            interval_minutes: number(&lookup, "BAYSLOT_SLOT_MINUTES").unwrap_or(defaults.interval_minutes),
            break_window,
            capacity: number(&lookup, "BAYSLOT_DEFAULT_CAPACITY").unwrap_or(defaults.capacity),
        };
        validate_schedule(&schedule)?;

        Ok(Self {
            bind: string("BAYSLOT_BIND", "0.0.0.0"),
            port: number(&lookup, "BAYSLOT_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(string("BAYSLOT_DATA_DIR", "./data")),
            credentials: Credentials {
                customer_password: string("BAYSLOT_CUSTOMER_PASSWORD", "customer"),
                supervisor_password: string("BAYSLOT_SUPERVISOR_PASSWORD", "supervisor"),
            },
            max_connections: number(&lookup, "BAYSLOT_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: number(&lookup, "BAYSLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: number(&lookup, "BAYSLOT_METRICS_PORT"),
            tls_cert: lookup("BAYSLOT_TLS_CERT"),
            tls_key: lookup("BAYSLOT_TLS_KEY"),
            schedule,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bayslot.wal")
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => return Err(ConfigError::PartialTls),
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| ConfigError::Tls("no private key found in key file".into()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn number<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// `HH:MM-HH:MM`, or `none`/empty for no window.
fn parse_window(s: &str) -> Option<Option<(NaiveTime, NaiveTime)>> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("none") {
        return Some(None);
    }
    let (from, until) = s.split_once('-')?;
    Some(Some((parse_time(from)?, parse_time(until)?)))
}

pub fn validate_schedule(schedule: &Schedule) -> Result<(), ConfigError> {
    if schedule.open >= schedule.close {
        return Err(ConfigError::Schedule("opening time must be before closing time"));
    }
    if schedule.interval_minutes == 0 {
        return Err(ConfigError::Schedule("slot length must be positive"));
    }
    if let Some((from, until)) = schedule.break_window
        && from >= until
    {
        return Err(ConfigError::Schedule("break must end after it starts"));
    }
    if schedule.capacity == 0 || schedule.capacity > MAX_CAPACITY {
        return Err(ConfigError::Schedule("default capacity out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.schedule, Schedule::default());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data").join("bayslot.wal"));
        assert!(cfg.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn malformed_numbers_fall_back() {
        let cfg = config(&[("BAYSLOT_PORT", "http"), ("BAYSLOT_COMPACT_THRESHOLD", "-5")]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.compact_threshold, 1000);
    }

    #[test]
    fn custom_schedule() {
        let cfg = config(&[
            ("BAYSLOT_OPEN", "08:00"),
            ("BAYSLOT_CLOSE", "12:00"),
            ("BAYSLOT_SLOT_MINUTES", "60"),
            ("BAYSLOT_BREAK", "none"),
            ("BAYSLOT_DEFAULT_CAPACITY", "4"),
        ])
        .unwrap();
        assert_eq!(cfg.schedule.open, t(8, 0));
        assert_eq!(cfg.schedule.break_window, None);
        assert_eq!(cfg.schedule.windows().len(), 4);
        assert_eq!(cfg.schedule.capacity, 4);

        let cfg = config(&[("BAYSLOT_BREAK", "12:00-12:30")]).unwrap();
        assert_eq!(cfg.schedule.break_window, Some((t(12, 0), t(12, 30))));
    }

    #[test]
    fn inconsistent_schedule_rejected() {
        assert!(matches!(
            config(&[("BAYSLOT_OPEN", "18:00"), ("BAYSLOT_CLOSE", "09:00")]),
            Err(ConfigError::Schedule(_))
        ));
        assert!(matches!(config(&[("BAYSLOT_SLOT_MINUTES", "0")]), Err(ConfigError::Schedule(_))));
        assert!(matches!(config(&[("BAYSLOT_BREAK", "14:00-13:00")]), Err(ConfigError::Schedule(_))));
        assert!(matches!(config(&[("BAYSLOT_BREAK", "lunch")]), Err(ConfigError::BadWindow { .. })));
        assert!(matches!(config(&[("BAYSLOT_OPEN", "9am")]), Err(ConfigError::BadTime { .. })));
    }

    #[test]
    fn tls_needs_both_files() {
        let cfg = config(&[("BAYSLOT_TLS_CERT", "/tmp/cert.pem")]).unwrap();
        assert!(matches!(cfg.tls_acceptor(), Err(ConfigError::PartialTls)));
    }
}
