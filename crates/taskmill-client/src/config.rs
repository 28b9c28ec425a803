//! Pipe configuration.

use taskmill_core::error::{MillError, Result};

const TWO_MIB: usize = 2 * 1024 * 1024;

/// Configuration for a [`crate::pipe::BatchingPipe`].
///
/// All thresholds are validated at construction; steady-state operation
/// never re-checks them.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Base URL of the ingestion server; events are POSTed to `<url>/events`.
    pub server_url: String,
    /// A batch is sealed once its estimated size passes this many bytes.
    pub max_batch_bytes: usize,
    /// A batch is sealed once this many seconds elapsed since it began,
    /// even if under the size threshold.
    pub max_batch_wait_secs: u64,
    /// Capacity of the bounded event buffer; events past it are dropped.
    pub max_buffer_size: usize,
    /// Character ceiling for exact-match (`strings`/`context`) values.
    pub max_chars_non_analyzed: usize,
    /// Character ceiling for free-text (`texts`) values.
    pub max_chars_analyzed: usize,
}

impl PipeConfig {
    /// Creates a configuration with the default thresholds for the given
    /// server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            max_batch_bytes: TWO_MIB,
            max_batch_wait_secs: 3,
            max_buffer_size: 200_000,
            max_chars_non_analyzed: 1_000,
            max_chars_analyzed: 100_000,
        }
    }

    /// Overrides the batch size threshold.
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    /// Overrides the batch wall-clock window.
    pub fn with_max_batch_wait_secs(mut self, max_batch_wait_secs: u64) -> Self {
        self.max_batch_wait_secs = max_batch_wait_secs;
        self
    }

    /// Overrides the buffer capacity.
    pub fn with_max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.max_buffer_size = max_buffer_size;
        self
    }

    /// Overrides the per-field-kind character ceilings.
    pub fn with_char_ceilings(mut self, non_analyzed: usize, analyzed: usize) -> Self {
        self.max_chars_non_analyzed = non_analyzed;
        self.max_chars_analyzed = analyzed;
        self
    }

    /// Validates all thresholds, failing fast on a bad configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MillError::Config`] when the server URL is missing or
    /// unparseable, or when any threshold is non-positive.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(MillError::config("Server URL must be provided"));
        }
        reqwest::Url::parse(&self.server_url)
            .map_err(|e| MillError::config(format!("Invalid server URL: {e}")))?;
        if self.max_batch_bytes == 0 {
            return Err(MillError::config("Batch size must be larger than 0"));
        }
        if self.max_batch_wait_secs == 0 {
            return Err(MillError::config("Batch wait must be larger than 0"));
        }
        if self.max_buffer_size == 0 {
            return Err(MillError::config("Buffer size must be larger than 0"));
        }
        if self.max_chars_non_analyzed == 0 || self.max_chars_analyzed == 0 {
            return Err(MillError::config("Character ceilings must be larger than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipeConfig::new("http://localhost:8484").validate().is_ok());
    }

    #[test]
    fn missing_or_invalid_url_fails_fast() {
        assert!(PipeConfig::new("").validate().unwrap_err().is_config());
        assert!(
            PipeConfig::new("not a url")
                .validate()
                .unwrap_err()
                .is_config()
        );
    }

    #[test]
    fn non_positive_thresholds_fail_fast() {
        let config = PipeConfig::new("http://localhost:8484").with_max_batch_bytes(0);
        assert!(config.validate().unwrap_err().is_config());

        let config = PipeConfig::new("http://localhost:8484").with_max_buffer_size(0);
        assert!(config.validate().unwrap_err().is_config());
    }
}
