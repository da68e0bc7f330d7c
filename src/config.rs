use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `SLOTLOCK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub policy_file: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotlock".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(5),
            policy_file: None,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable numeric values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;
        Self {
            port: parsed(lookup, "SLOTLOCK_PORT").unwrap_or(defaults.port),
            bind: lookup("SLOTLOCK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTLOCK_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("SLOTLOCK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(lookup, "SLOTLOCK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(lookup, "SLOTLOCK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parsed(lookup, "SLOTLOCK_SWEEP_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map_or(defaults.sweep_interval, Duration::from_secs),
            policy_file: lookup("SLOTLOCK_POLICY_FILE").map(PathBuf::from),
            metrics_port: parsed(lookup, "SLOTLOCK_METRICS_PORT"),
            tls_cert: lookup("SLOTLOCK_TLS_CERT"),
            tls_key: lookup("SLOTLOCK_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), ServerConfig::default());
        assert_eq!(config(&[]).listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn reads_every_setting() {
        let c = config(&[
            ("SLOTLOCK_PORT", "6000"),
            ("SLOTLOCK_BIND", "127.0.0.1"),
            ("SLOTLOCK_DATA_DIR", "/var/lib/slotlock"),
            ("SLOTLOCK_PASSWORD", "s3cret"),
            ("SLOTLOCK_MAX_CONNECTIONS", "16"),
            ("SLOTLOCK_COMPACT_THRESHOLD", "50"),
            ("SLOTLOCK_SWEEP_INTERVAL_SECS", "2"),
            ("SLOTLOCK_POLICY_FILE", "/etc/slotlock/policy.json"),
            ("SLOTLOCK_METRICS_PORT", " 9100 "),
        ]);
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/slotlock"));
        assert_eq!(c.password, "s3cret");
        assert_eq!(c.max_connections, 16);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.sweep_interval, Duration::from_secs(2));
        assert_eq!(c.policy_file, Some(PathBuf::from("/etc/slotlock/policy.json")));
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let c = config(&[
            ("SLOTLOCK_PORT", "http"),
            ("SLOTLOCK_SWEEP_INTERVAL_SECS", "0"),
            ("SLOTLOCK_METRICS_PORT", "-1"),
        ]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.sweep_interval, Duration::from_secs(5));
        assert_eq!(c.metrics_port, None);
    }
}
