//! Cache budget configuration.
//!
//! The cache counts resident records (active plus zombie) against a soft
//! entry ceiling. Configuration can be loaded from environment variables or
//! created programmatically.

/// Default soft ceiling on resident records.
pub const DEFAULT_MAX_ENTRIES: usize = 200;

/// Configuration for the tile cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Soft ceiling on resident records (active + zombies). The eviction
    /// routine runs on every insertion and drives the total back down, but
    /// the count may transiently exceed this value.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given entry ceiling.
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// Set the entry ceiling.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TILEVIEW_CACHE_MAX_ENTRIES`: resident record ceiling (default: 200)
    ///
    /// # Errors
    /// Returns an error if a variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TILEVIEW_CACHE_MAX_ENTRIES") {
            config.max_entries = val
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidValue("TILEVIEW_CACHE_MAX_ENTRIES".to_string()))?;
        }

        Ok(config)
    }
}

/// Configuration loading errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::new(64).with_max_entries(16);
        assert_eq!(config.max_entries, 16);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("TILEVIEW_CACHE_MAX_ENTRIES", "42");
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.max_entries, 42);
        std::env::remove_var("TILEVIEW_CACHE_MAX_ENTRIES");
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_value() {
        std::env::set_var("TILEVIEW_CACHE_MAX_ENTRIES", "not-a-number");
        let err = CacheConfig::from_env().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue("TILEVIEW_CACHE_MAX_ENTRIES".to_string())
        );
        std::env::remove_var("TILEVIEW_CACHE_MAX_ENTRIES");
    }

    #[test]
    #[serial]
    fn test_from_env_unset_uses_default() {
        std::env::remove_var("TILEVIEW_CACHE_MAX_ENTRIES");
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config, CacheConfig::default());
    }
}
