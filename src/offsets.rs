//! Per-partition committed offsets.
//!
//! Producers number their readings with a per-partition `seq`. A worker sends
//! [`AckCommand::Settled`] once a batch has been written or dead-lettered; the
//! committed offset only moves across a contiguous run of settled sequence
//! numbers, so anything not yet settled is replayed after a restart. A gap
//! that stays open while more than [`DEFAULT_MAX_PENDING`] later receipts
//! pile up is skipped with a warning.

use crate::config::Config;
use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use sqlx::PgPool;
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckCommand {
    Settled { partition: String, seqs: Vec<u64> },
}

pub fn channel() -> (
    mpsc::UnboundedSender<AckCommand>,
    mpsc::UnboundedReceiver<AckCommand>,
) {
    mpsc::unbounded_channel()
}

pub const DEFAULT_MAX_PENDING: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTracker {
    committed: u64,
    pending: BTreeSet<u64>,
    max_pending: usize,
    last_published: Option<u64>,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self {
            committed: 0,
            pending: BTreeSet::new(),
            max_pending: DEFAULT_MAX_PENDING,
            last_published: None,
        }
    }
}

impl OffsetTracker {
    pub fn with_committed(committed: u64) -> Self {
        Self {
            committed,
            ..Self::default()
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Records settled sequence numbers. Returns true when the committed
    /// offset moved.
    ///
    /// When more than `max_pending` receipts wait behind a gap, the oldest
    /// gap is abandoned and the offset jumps over it.
    pub fn settle<I>(&mut self, seqs: I) -> bool
    where
        I: IntoIterator<Item = u64>,
    {
        for seq in seqs {
            if seq > self.committed {
                self.pending.insert(seq);
            }
        }
        let mut advanced = self.drain_contiguous();
        while self.pending.len() > self.max_pending {
            let Some(&first) = self.pending.first() else {
                break;
            };
            tracing::warn!(
                skipped_from = self.committed + 1,
                skipped_to = first - 1,
                pending = self.pending.len(),
                "sequence gap never settled; skipping it"
            );
            self.committed = first - 1;
            advanced |= self.drain_contiguous();
        }
        advanced
    }

    fn drain_contiguous(&mut self) -> bool {
        let mut advanced = false;
        while self.pending.remove(&self.committed.saturating_add(1)) {
            self.committed += 1;
            advanced = true;
        }
        advanced
    }

    fn needs_publish(&self) -> bool {
        self.last_published != Some(self.committed)
    }
}

/// Offsets for every partition seen so far.
#[derive(Debug, Default)]
pub struct OffsetBook {
    partitions: HashMap<String, OffsetTracker>,
}

impl OffsetBook {
    pub fn tracker(&self, partition: &str) -> Option<&OffsetTracker> {
        self.partitions.get(partition)
    }

    /// Applies a command and returns the new committed offset when it moved.
    pub fn apply(&mut self, cmd: AckCommand) -> Option<(String, u64)> {
        match cmd {
            AckCommand::Settled { partition, seqs } => {
                if partition.trim().is_empty() || seqs.is_empty() {
                    return None;
                }
                let tracker = self.partitions.entry(partition.clone()).or_default();
                let _span = tracing::debug_span!("settle", %partition).entered();
                tracker
                    .settle(seqs)
                    .then(|| (partition, tracker.committed()))
            }
        }
    }

    /// Partitions whose committed offset has not been published yet.
    pub fn unpublished(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .partitions
            .iter()
            .filter(|(_, tracker)| tracker.committed > 0 && tracker.needs_publish())
            .map(|(partition, tracker)| (partition.clone(), tracker.committed))
            .collect();
        out.sort();
        out
    }

    pub fn mark_published(&mut self, partition: &str, committed: u64) {
        if let Some(tracker) = self.partitions.get_mut(partition) {
            tracker.last_published = Some(committed);
        }
    }
}

pub fn ack_topic(prefix: &str, partition: &str) -> String {
    format!("{prefix}/{partition}/ack")
}

pub fn ack_payload(committed: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({ "committed_seq": committed })).unwrap_or_default()
}

/// Applies settled receipts, persists committed offsets and publishes them to
/// producers once a second. Returns when the command channel closes.
pub async fn run_ack_manager(
    config: Config,
    pool: PgPool,
    mut rx: mpsc::UnboundedReceiver<AckCommand>,
) -> Result<()> {
    let mut book = match load_offsets(&pool).await {
        Ok(book) => book,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load committed offsets; starting empty");
            OffsetBook::default()
        }
    };

    loop {
        let mut mqttoptions = MqttOptions::new(
            format!("{}-ack", config.mqtt_client_id),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
        tracing::info!("offset publisher connecting to MQTT");

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    publish_offsets(&client, &config.mqtt_topic_prefix, &mut book).await;
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()); };
                    if let Some((partition, committed)) = book.apply(cmd) {
                        if let Err(err) = persist_offset(&pool, &partition, committed).await {
                            tracing::warn!(
                                error = %err,
                                %partition,
                                committed,
                                "failed to persist committed offset"
                            );
                        }
                    }
                }
                ev = eventloop.poll() => {
                    if let Err(err) = ev {
                        tracing::warn!(
                            error = %err,
                            "offset MQTT connection dropped; reconnecting"
                        );
                        break;
                    }
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

async fn load_offsets(pool: &PgPool) -> Result<OffsetBook> {
    let rows = sqlx::query("SELECT partition_id, committed_seq FROM ingest_offsets")
        .fetch_all(pool)
        .await
        .context("load ingest_offsets")?;

    let mut book = OffsetBook::default();
    for row in rows {
        let partition: String = row.try_get("partition_id")?;
        let committed: i64 = row.try_get("committed_seq")?;
        book.partitions
            .insert(partition, OffsetTracker::with_committed(committed.max(0) as u64));
    }
    tracing::info!(partitions = book.partitions.len(), "loaded committed offsets");
    Ok(book)
}

async fn persist_offset(pool: &PgPool, partition: &str, committed: u64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingest_offsets (partition_id, committed_seq, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (partition_id)
        DO UPDATE SET
            committed_seq = GREATEST(ingest_offsets.committed_seq, EXCLUDED.committed_seq),
            updated_at = NOW()
        "#,
    )
    .bind(partition)
    .bind(committed as i64)
    .execute(pool)
    .await
    .context("persist committed offset")?;
    Ok(())
}

async fn publish_offsets(client: &AsyncClient, prefix: &str, book: &mut OffsetBook) {
    for (partition, committed) in book.unpublished() {
        match client
            .publish(
                ack_topic(prefix, &partition),
                QoS::AtLeastOnce,
                false,
                ack_payload(committed),
            )
            .await
        {
            Ok(_) => book.mark_published(&partition, committed),
            Err(err) => {
                tracing::debug!(error = %err, %partition, "failed to publish committed offset");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_offset_waits_for_gaps() {
        let mut tracker = OffsetTracker::default();
        assert!(!tracker.settle([2, 3]));
        assert_eq!(tracker.committed(), 0);
        assert_eq!(tracker.pending(), 2);

        assert!(tracker.settle([1]));
        assert_eq!(tracker.committed(), 3);
        assert_eq!(tracker.pending(), 0);

        // Replays at or below the committed offset are ignored.
        assert!(!tracker.settle([1, 2, 3]));
        assert!(tracker.settle([5, 4, 7]));
        assert_eq!(tracker.committed(), 5);
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn pending_stays_bounded_behind_a_permanent_gap() {
        // Odd sequence numbers never settle.
        let mut tracker = OffsetTracker::default().with_max_pending(100);
        for seq in (2..=2000u64).step_by(2) {
            tracker.settle([seq]);
            assert!(tracker.pending() <= 100, "pending {}", tracker.pending());
        }
        assert_eq!(tracker.pending(), 100);
        assert_eq!(tracker.committed(), 1800);

        // Late receipts for skipped numbers are ignored.
        assert!(!tracker.settle([1, 1799]));
        assert_eq!(tracker.pending(), 100);
    }

    #[test]
    fn resumes_from_persisted_offset() {
        let mut tracker = OffsetTracker::with_committed(41);
        assert!(tracker.settle([42]));
        assert_eq!(tracker.committed(), 42);
    }

    #[test]
    fn book_tracks_partitions_independently() {
        let mut book = OffsetBook::default();
        assert_eq!(
            book.apply(AckCommand::Settled {
                partition: "sim-a".to_string(),
                seqs: vec![1, 2],
            }),
            Some(("sim-a".to_string(), 2))
        );
        assert_eq!(
            book.apply(AckCommand::Settled {
                partition: "sim-b".to_string(),
                seqs: vec![2],
            }),
            None
        );
        assert_eq!(
            book.apply(AckCommand::Settled {
                partition: " ".to_string(),
                seqs: vec![1],
            }),
            None
        );
        assert_eq!(book.unpublished(), vec![("sim-a".to_string(), 2)]);

        book.mark_published("sim-a", 2);
        assert!(book.unpublished().is_empty());
        assert_eq!(book.tracker("sim-b").map(OffsetTracker::pending), Some(1));
    }

    #[test]
    fn ack_payload_carries_committed_seq() {
        assert_eq!(ack_topic("iot", "sim-a"), "iot/sim-a/ack");
        let decoded: serde_json::Value = serde_json::from_slice(&ack_payload(9)).unwrap();
        assert_eq!(decoded["committed_seq"], 9);
    }
}
