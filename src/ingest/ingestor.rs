use super::{BatchOutcome, ReadingIngestor, RetryPolicy};
use crate::error::IngestError;
use crate::model::{InboundReading, Reading};
use crate::pipeline::IngestStats;
use crate::store::{DeadLetter, DeadLetterSink, RawStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl ReadingIngestor {
    pub fn new(
        raw: Arc<dyn RawStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            raw,
            dead_letters,
            retry,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Drops invalid readings, then writes the rest as one all-or-nothing
    /// batch. Returns `Err` only when the batch could be neither written nor
    /// dead-lettered, in which case it must not be acknowledged.
    pub async fn ingest_batch(
        &self,
        batch: &[InboundReading],
    ) -> Result<BatchOutcome, IngestError> {
        self.stats
            .received
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let valid: Vec<Reading> = batch.iter().filter_map(InboundReading::validate).collect();
        let dropped = batch.len() - valid.len();
        if dropped > 0 {
            self.stats
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::debug!(dropped, batch = batch.len(), "dropped invalid readings");
        }
        if valid.is_empty() {
            return Ok(BatchOutcome::Filtered { dropped });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.raw.insert_batch(&valid).await {
                Ok(rows) => {
                    self.stats.written.fetch_add(rows, Ordering::Relaxed);
                    tracing::debug!(rows, attempt, "wrote readings batch");
                    return Ok(BatchOutcome::Written { rows, dropped });
                }
                Err(err) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        error = %err,
                        attempt,
                        max_attempts,
                        rows = valid.len(),
                        "failed to write readings batch"
                    );
                    if attempt < max_attempts {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        let letter = DeadLetter::new(batch.to_vec(), last_error.clone(), max_attempts);
        let letter_id = letter.id;
        self.dead_letters
            .dead_letter(letter)
            .await
            .map_err(|source| IngestError::DeadLetter {
                len: batch.len(),
                source,
            })?;
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            id = %letter_id,
            attempts = max_attempts,
            reason = %last_error,
            batch = batch.len(),
            "readings batch dead-lettered"
        );
        Ok(BatchOutcome::DeadLettered {
            dropped,
            attempts: max_attempts,
            reason: last_error,
        })
    }
}
