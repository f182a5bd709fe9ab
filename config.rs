//! Engine tunables.
//!
//! Resolved once at bootstrap from the environment; the engine only reads them.

use crate::{Error, Result};

/// Copies and segments at or below this many bytes are never virtualized.
pub const DEFAULT_THRESHOLD: usize = 4096;

/// Environment variable overriding [`Config::threshold`].
pub const THRESHOLD_VAR: &str = "ZCOPY_THRESHOLD";

/// Environment variable holding the `tracing` filter directives.
pub const LOG_VAR: &str = "ZCOPY_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Copies and send segments must be longer than this to be virtualized,
    /// and a new alias must borrow more than this many bytes. What a fault
    /// leaves of an alias stays virtual only while it is at least this long.
    pub threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve the configuration through `lookup`, which maps a variable
    /// name to its value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(THRESHOLD_VAR) {
            config.threshold = parse_threshold(&value)?;
        }
        Ok(config)
    }
}

fn parse_threshold(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(Error::Config(format!("{THRESHOLD_VAR} must be positive"))),
        Ok(threshold) => Ok(threshold),
        Err(err) => Err(Error::Config(format!("{THRESHOLD_VAR}={value:?}: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.threshold, 4096);
    }

    #[test]
    fn test_threshold_override() {
        let config = Config::from_lookup(|name| (name == THRESHOLD_VAR).then(|| " 65536".into())).unwrap();
        assert_eq!(config.threshold, 65536);
    }

    #[test]
    fn test_invalid_threshold() {
        for value in ["0", "-1", "4k", ""] {
            let err = Config::from_lookup(|_| Some(value.to_string())).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{value:?}");
        }
    }
}
