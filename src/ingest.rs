mod ingestor;


use crate::config::Config;
use crate::pipeline::IngestStats;
use crate::store::{DeadLetterSink, RawStore};
use std::sync::Arc;
use std::time::Duration;

/// Validates inbound batches and writes them to the raw store, retrying
/// failed writes and dead-lettering batches that exhaust their attempts.
#[derive(Clone)]
pub struct ReadingIngestor {
    raw: Arc<dyn RawStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    stats: Arc<IngestStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
            ..Self::default()
        }
    }

    /// Delay after failed attempt `attempt` (1-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Terminal result of one batch. Every variant is safe to acknowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Written {
        rows: u64,
        dropped: usize,
    },
    /// Nothing valid was left to write.
    Filtered {
        dropped: usize,
    },
    DeadLettered {
        dropped: usize,
        attempts: u32,
        reason: String,
    },
}
