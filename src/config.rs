//! Connection descriptors and pool tuning.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PqMiddlewareError;

/// Option keys accepted in a [`PoolKey`]. Alias normalization happens before a
/// descriptor reaches this crate.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "host",
    "hostaddr",
    "port",
    "user",
    "password",
    "dbname",
    "connect_timeout",
    "client_encoding",
    "options",
    "application_name",
    "sslmode",
    "target_session_attrs",
    "keepalives",
    "keepalives_idle",
];

/// Canonical connection descriptor.
///
/// Keys are lower-cased and must be one of [`RECOGNIZED_KEYS`]; options are
/// held in a sorted map so two descriptors with the same options compare and
/// hash equal regardless of the order they were supplied in.
///
/// ```rust
/// use pq_middleware::PoolKey;
///
/// let a = PoolKey::from_pairs([("host", "db1"), ("port", "5432"), ("user", "app")])?;
/// let b = PoolKey::from_pairs([("USER", "app"), ("host", "db1"), ("port", "5432")])?;
/// assert_eq!(a, b);
/// # Ok::<(), pq_middleware::PqMiddlewareError>(())
/// ```
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    options: BTreeMap<String, String>,
}

impl PoolKey {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key from option pairs. Later duplicates win.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` for an unrecognized key.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, PqMiddlewareError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        pairs
            .into_iter()
            .try_fold(Self::new(), |key, (k, v)| key.with(k.as_ref(), v))
    }

    /// Set one option.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` for an unrecognized key.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Result<Self, PqMiddlewareError> {
        let key = key.trim().to_ascii_lowercase();
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            return Err(PqMiddlewareError::ConfigError(format!(
                "unrecognized connection option '{key}'"
            )));
        }
        self.options.insert(key, value.into());
        Ok(self)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.get("host")
    }

    #[must_use]
    pub fn dbname(&self) -> Option<&str> {
        self.get("dbname")
    }

    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    /// Parsed `port`, when present.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` when the port is not a number.
    pub fn port(&self) -> Result<Option<u16>, PqMiddlewareError> {
        self.get("port")
            .map(|raw| {
                raw.parse::<u16>().map_err(|_| {
                    PqMiddlewareError::ConfigError(format!("invalid port '{raw}'"))
                })
            })
            .transpose()
    }

    /// Parsed `connect_timeout` in seconds. Values below two seconds are raised to two.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` when the value is not a number.
    pub fn connect_timeout(&self) -> Result<Option<Duration>, PqMiddlewareError> {
        self.get("connect_timeout")
            .map(|raw| {
                raw.parse::<u64>()
                    .map(|secs| Duration::from_secs(secs.max(2)))
                    .map_err(|_| {
                        PqMiddlewareError::ConfigError(format!("invalid connect_timeout '{raw}'"))
                    })
            })
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.options {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if k == "password" {
                write!(f, "{k}=***")?;
            } else {
                write!(f, "{k}={v}")?;
            }
        }
        Ok(())
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolKey").field(&self.to_string()).finish()
    }
}

/// Tuning knobs for [`crate::ConnectionPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Delay between background sweeps.
    pub sweep_interval: Duration,
    /// Idle handles kept per key; releases beyond this close the handle.
    pub max_idle_per_key: usize,
    /// Sweeps a bucket head may survive before the bucket is thinned.
    pub visit_threshold: u32,
    /// Polls allowed for the liveness probe to complete.
    pub probe_retries: u32,
    /// Sleep between liveness probe polls.
    pub probe_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            max_idle_per_key: 50,
            visit_threshold: 2,
            probe_retries: 20,
            probe_interval: Duration::from_millis(25),
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_idle_per_key(mut self, max: usize) -> Self {
        self.max_idle_per_key = max;
        self
    }

    #[must_use]
    pub fn with_visit_threshold(mut self, threshold: u32) -> Self {
        self.visit_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, retries: u32, interval: Duration) -> Self {
        self.probe_retries = retries;
        self.probe_interval = interval;
        self
    }

    /// Load settings from JSON; missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` on malformed JSON or a zero sweep interval.
    pub fn from_json(raw: &str) -> Result<Self, PqMiddlewareError> {
        let settings: PoolSettings = serde_json::from_str(raw)
            .map_err(|e| PqMiddlewareError::ConfigError(format!("pool settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    /// Returns `PqMiddlewareError::ConfigError` when the sweep interval is zero.
    pub fn validate(&self) -> Result<(), PqMiddlewareError> {
        if self.sweep_interval.is_zero() {
            return Err(PqMiddlewareError::ConfigError(
                "sweep_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_order_independent() {
        let a = PoolKey::from_pairs([("host", "h"), ("dbname", "d")]).unwrap();
        let b = PoolKey::from_pairs([("DBNAME", "d"), (" host ", "h")]).unwrap();
        let set: HashSet<_> = [a.clone(), b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_eq!(a.host(), Some("h"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PoolKey::new().with("hots", "x").unwrap_err();
        assert!(matches!(err, PqMiddlewareError::ConfigError(_)));
    }

    #[test]
    fn password_is_masked() {
        let key = PoolKey::from_pairs([("user", "u"), ("password", "secret")]).unwrap();
        assert_eq!(key.to_string(), "password=*** user=u");
        assert!(!format!("{key:?}").contains("secret"));
    }

    #[test]
    fn connect_timeout_has_floor() {
        let key = PoolKey::new().with("connect_timeout", "1").unwrap();
        assert_eq!(key.connect_timeout().unwrap(), Some(Duration::from_secs(2)));
        let bad = PoolKey::new().with("port", "abc").unwrap();
        assert!(bad.port().is_err());
    }

    #[test]
    fn settings_from_partial_json() {
        let settings = PoolSettings::from_json(r#"{"max_idle_per_key": 5}"#).unwrap();
        assert_eq!(settings.max_idle_per_key, 5);
        assert_eq!(settings.visit_threshold, 2);
        assert_eq!(settings.sweep_interval, Duration::from_secs(30));
    }
}
