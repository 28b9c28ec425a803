//! Persistence engine configuration.

use taskmill_core::error::{MillError, Result};

/// Configuration for the server-side persistence stack: bulk engine, index
/// lifecycle manager and retention.
///
/// All values are validated at construction; a non-positive threshold fails
/// fast rather than being silently defaulted.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A bulk batch is sealed once its estimated encoded size passes this.
    pub bulk_size_bytes: usize,
    /// Upper bound on concurrently executing bulk submissions.
    pub indexing_threads: usize,
    /// Rollover condition: index age ceiling in days.
    pub max_index_age_days: i64,
    /// Rollover condition: index size ceiling in gigabytes.
    pub max_index_size_gb: u64,
    /// Rollover condition: index document-count ceiling.
    pub max_index_docs: u64,
    /// Retry ceiling for registered failed bulk batches.
    pub max_index_retries: u32,
    /// Retry ceiling for the rollover migration cycle.
    pub max_migration_retries: u32,
    /// Days a task document is retained before the sweeper may delete it.
    pub retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bulk_size_bytes: 2 * 1024 * 1024,
            indexing_threads: 4,
            max_index_age_days: 7,
            max_index_size_gb: 50,
            max_index_docs: 100_000_000,
            max_index_retries: 3,
            max_migration_retries: 3,
            retention_days: 90,
        }
    }
}

impl EngineConfig {
    /// Validates every threshold, failing fast on a bad configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MillError::Config`] naming the first offending property.
    pub fn validate(&self) -> Result<()> {
        if self.bulk_size_bytes == 0 {
            return Err(MillError::config("Bulk size property should be larger than 0"));
        }
        if self.indexing_threads == 0 {
            return Err(MillError::config(
                "Indexing threads property should be larger than 0",
            ));
        }
        if self.max_index_age_days < 1 {
            return Err(MillError::config(
                "Index max age property should be larger than 0",
            ));
        }
        if self.max_index_size_gb == 0 {
            return Err(MillError::config(
                "Index max size property should be larger than 0",
            ));
        }
        if self.max_index_docs == 0 {
            return Err(MillError::config(
                "Index max docs property should be larger than 0",
            ));
        }
        if self.max_index_retries == 0 {
            return Err(MillError::config(
                "Index retries property should be larger than 0",
            ));
        }
        if self.max_migration_retries == 0 {
            return Err(MillError::config(
                "Migration retries property should be larger than 0",
            ));
        }
        if self.retention_days < 1 {
            return Err(MillError::config(
                "Retention days property should be larger than 0",
            ));
        }
        Ok(())
    }
}
