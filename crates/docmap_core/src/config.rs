//! Session configuration.

use crate::event::EventManager;
use crate::metadata::MetadataRegistry;
use std::sync::Arc;

/// What a non-transactional flush does when a write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Attempt every remaining write and report all failures together.
    #[default]
    ContinueOnError,
    /// Stop at the first failed write.
    StopOnFirstError,
}

/// Configuration for a unit of work.
///
/// Built once and shared as `Arc<Configuration>`; sessions never mutate it.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Mapping metadata for every class the session may manage.
    pub metadata: Arc<MetadataRegistry>,

    /// Whether each flush runs inside a backend transaction.
    ///
    /// A transactional flush is all-or-nothing: the first failure aborts the
    /// transaction and every document stays scheduled.
    pub transactional_flush: bool,

    /// How many times a transactional flush is retried after a transient
    /// failure before the error is returned.
    pub max_transaction_retries: u32,

    /// Failure handling for non-transactional flushes.
    pub failure_policy: FailurePolicy,

    /// Lifecycle event dispatch.
    pub events: EventManager,
}

impl Configuration {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new(metadata: impl Into<Arc<MetadataRegistry>>) -> Self {
        Self {
            metadata: metadata.into(),
            transactional_flush: false,
            max_transaction_retries: 2,
            failure_policy: FailurePolicy::default(),
            events: EventManager::new(),
        }
    }

    /// Sets whether flushes run inside a backend transaction.
    #[must_use]
    pub const fn transactional_flush(mut self, value: bool) -> Self {
        self.transactional_flush = value;
        self
    }

    /// Sets the transient-failure retry limit for transactional flushes.
    #[must_use]
    pub const fn max_transaction_retries(mut self, retries: u32) -> Self {
        self.max_transaction_retries = retries;
        self
    }

    /// Sets the failure policy for non-transactional flushes.
    #[must_use]
    pub const fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the event manager.
    #[must_use]
    pub fn events(mut self, events: EventManager) -> Self {
        self.events = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Configuration::new(MetadataRegistry::builder().build().unwrap());
        assert!(!config.transactional_flush);
        assert_eq!(config.max_transaction_retries, 2);
        assert_eq!(config.failure_policy, FailurePolicy::ContinueOnError);
        assert!(config.metadata.is_empty());
    }

    #[test]
    fn builder_pattern() {
        let config = Configuration::new(MetadataRegistry::builder().build().unwrap())
            .transactional_flush(true)
            .max_transaction_retries(5)
            .failure_policy(FailurePolicy::StopOnFirstError);

        assert!(config.transactional_flush);
        assert_eq!(config.max_transaction_retries, 5);
        assert_eq!(config.failure_policy, FailurePolicy::StopOnFirstError);
    }
}
