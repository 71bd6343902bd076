//! Idempotent Ingestion Gate and the partitioned event queue feeding it.
//!
//! Delivery is at-least-once. The gate turns every delivery of the same CAF
//! into at most one engine instance: the whole find/insert/provision/start
//! sequence runs under the business reference's key lock, and a record that
//! is already bound returns early as a duplicate.
//!
//! The queue is partitioned by business reference. Each lane is consumed by
//! one loop, so messages for the same CAF are handled in order and a
//! redelivery is retried before anything behind it on that lane.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::key_lock::KeyedLocks;
use super::lifecycle::ProcessLifecycleManager;
use super::provisioner::IdentityProvisioner;
use super::store::{CorrelationStore, DeadLetter, DeadLetterSink, DeadLetterSource};
use super::types::{CafEvent, OnboardingRecord, RecordStatus};
use crate::error::{OnboardingError, OnboardingResult, ProvisionError};

// ─── Gate ────────────────────────────────────────────────────────────────────

/// Result of one successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// This call bound a process instance (started or recovered).
    Started {
        business_ref: String,
        process_instance_id: String,
    },
    /// The CAF was already ingested; nothing changed.
    Duplicate {
        business_ref: String,
        process_instance_id: Option<String>,
    },
}

pub struct IngestionGate {
    store: Arc<dyn CorrelationStore>,
    provisioner: Arc<dyn IdentityProvisioner>,
    lifecycle: Arc<ProcessLifecycleManager>,
    locks: KeyedLocks,
    provisioner_timeout: Duration,
}

impl IngestionGate {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        provisioner: Arc<dyn IdentityProvisioner>,
        lifecycle: Arc<ProcessLifecycleManager>,
        locks: KeyedLocks,
        provisioner_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            lifecycle,
            locks,
            provisioner_timeout,
        }
    }

    /// Ingest one raw CAF event.
    ///
    /// Malformed payloads fail before any state is touched. A provisioning
    /// failure leaves the record in `IDENTITY_FAILED` with no instance; a
    /// redelivery resumes from there.
    pub async fn ingest(&self, raw: &[u8]) -> OnboardingResult<IngestOutcome> {
        let event = CafEvent::parse(raw)?;
        let business_ref = event.caf_ref_no.as_str();
        let _guard = self.locks.lock(business_ref).await;

        let mut record = match self.store.find_by_ref(business_ref).await? {
            Some(existing) if existing.process_instance_id.is_some() || existing.status.is_terminal() => {
                tracing::info!(
                    business_ref = business_ref,
                    status = %existing.status,
                    "Duplicate CAF event ignored"
                );
                return Ok(IngestOutcome::Duplicate {
                    business_ref: business_ref.to_string(),
                    process_instance_id: existing.process_instance_id,
                });
            }
            Some(existing) => {
                tracing::info!(
                    business_ref = business_ref,
                    status = %existing.status,
                    "Resuming ingestion of unbound record"
                );
                existing
            }
            None => {
                let created = self.store.insert_if_absent(&event.to_new_record()).await?;
                tracing::info!(
                    business_ref = business_ref,
                    record_id = created.id,
                    zone_code = %created.zone_code,
                    identity_bearing = created.identity_bearing,
                    "Onboarding record created"
                );
                created
            }
        };

        if record.needs_provisioning() {
            let identity = self.provision(&record).await?;
            self.store
                .set_permanent_identity(business_ref, &identity)
                .await?;
            record.permanent_identity = Some(identity);
        }

        let process_instance_id = self.lifecycle.start_instance(&record).await?;
        Ok(IngestOutcome::Started {
            business_ref: business_ref.to_string(),
            process_instance_id,
        })
    }

    async fn provision(&self, record: &OnboardingRecord) -> OnboardingResult<String> {
        let business_ref = record.business_ref.as_str();
        let result = match tokio::time::timeout(
            self.provisioner_timeout,
            self.provisioner.provision(&record.plan_code, business_ref),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Timeout {
                timeout_ms: self.provisioner_timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(identity) if !identity.trim().is_empty() => {
                tracing::info!(
                    business_ref = business_ref,
                    plan_code = %record.plan_code,
                    "Permanent identity provisioned"
                );
                Ok(identity)
            }
            Ok(_) => Err(self.provisioning_failed(business_ref, ProvisionError::Empty).await),
            Err(e) => Err(self.provisioning_failed(business_ref, e).await),
        }
    }

    async fn provisioning_failed(&self, business_ref: &str, err: ProvisionError) -> OnboardingError {
        tracing::warn!(
            business_ref = business_ref,
            error = %err,
            "Identity provisioning failed"
        );
        if let Err(store_err) = self
            .store
            .update_status(business_ref, RecordStatus::IdentityFailed)
            .await
        {
            return OnboardingError::Store(store_err);
        }
        OnboardingError::ProvisioningError {
            business_ref: business_ref.to_string(),
            message: err.to_string(),
        }
    }
}

// ─── Queue ───────────────────────────────────────────────────────────────────

/// One message taken off a queue lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Partition key (the business reference, when it could be read).
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// What the consumer decided to do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Written to the dead-letter sink; never redelivered.
    DeadLetter(String),
    /// Deliver again, ahead of anything queued behind it.
    Redeliver,
}

/// A single ordered queue partition.
#[async_trait]
pub trait EventSource: Send {
    /// Next delivery, or `None` once the source is closed.
    async fn next(&mut self) -> Option<Delivery>;

    async fn settle(&mut self, delivery: Delivery, disposition: Disposition) -> Result<()>;
}

/// In-process lane backed by an mpsc channel.
pub struct ChannelEventSource {
    lane: usize,
    rx: mpsc::Receiver<Delivery>,
    redeliver: Option<(Delivery, Instant)>,
    backoff: Duration,
}

impl ChannelEventSource {
    pub fn lane(&self) -> usize {
        self.lane
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next(&mut self) -> Option<Delivery> {
        if let Some((_, ready_at)) = &self.redeliver {
            tokio::time::sleep_until(*ready_at).await;
        }
        if let Some((delivery, _)) = self.redeliver.take() {
            return Some(delivery);
        }
        self.rx.recv().await
    }

    async fn settle(&mut self, mut delivery: Delivery, disposition: Disposition) -> Result<()> {
        if disposition == Disposition::Redeliver {
            delivery.attempt += 1;
            self.redeliver = Some((delivery, Instant::now() + self.backoff));
        }
        Ok(())
    }
}

/// Producer side of the partitioned queue.
#[derive(Clone)]
pub struct PartitionedPublisher {
    lanes: Vec<mpsc::Sender<Delivery>>,
}

impl PartitionedPublisher {
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    pub async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let lane = self.lane_for(key);
        self.lanes[lane]
            .send(Delivery {
                key: key.to_string(),
                payload,
                attempt: 1,
            })
            .await
            .with_context(|| format!("Ingestion lane {} is closed", lane))
    }

    /// Publish a raw CAF payload, partitioned by its `caf_ref_no` when present.
    pub async fn publish_raw(&self, payload: Vec<u8>) -> Result<()> {
        let key = partition_key(&payload);
        self.publish(&key, payload).await
    }
}

/// Best-effort partition key; unreadable payloads share the empty key and
/// are dead-lettered by the consumer.
pub fn partition_key(payload: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("caf_ref_no")?.as_str().map(|s| s.trim().to_string()))
        .unwrap_or_default()
}

/// Build `lanes` channel partitions sharing one publisher.
pub fn partitioned_channels(
    lanes: usize,
    capacity: usize,
    redelivery_backoff: Duration,
) -> (PartitionedPublisher, Vec<ChannelEventSource>) {
    let lanes = lanes.max(1);
    let (senders, sources): (Vec<_>, Vec<_>) = (0..lanes)
        .map(|lane| {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let source = ChannelEventSource {
                lane,
                rx,
                redeliver: None,
                backoff: redelivery_backoff,
            };
            (tx, source)
        })
        .unzip();
    (PartitionedPublisher { lanes: senders }, sources)
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// Consumes queue lanes and feeds the ingestion gate.
pub struct IngestionWorker {
    gate: Arc<IngestionGate>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl IngestionWorker {
    pub fn new(gate: Arc<IngestionGate>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self { gate, dead_letters }
    }

    /// Spawn one consumer loop per source.
    pub fn spawn<S>(self: Arc<Self>, sources: Vec<S>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>>
    where
        S: EventSource + 'static,
    {
        sources
            .into_iter()
            .enumerate()
            .map(|(lane, source)| {
                let worker = Arc::clone(&self);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(lane, source, shutdown_rx).await })
            })
            .collect()
    }

    /// Run one lane until the source closes or shutdown is signalled.
    pub async fn run<S: EventSource>(&self, lane: usize, mut source: S, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(lane = lane, "IngestionWorker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let delivery = tokio::select! {
                delivery = source.next() => delivery,
                _ = shutdown_rx.changed() => {
                    tracing::info!(lane = lane, "IngestionWorker shutting down");
                    break;
                }
            };
            let Some(delivery) = delivery else {
                tracing::info!(lane = lane, "Ingestion lane closed");
                break;
            };

            let disposition = self.process(&delivery).await;
            if let Err(e) = source.settle(delivery, disposition).await {
                tracing::error!(lane = lane, error = %e, "Failed to settle delivery");
            }
        }

        tracing::info!(lane = lane, "IngestionWorker stopped");
    }

    /// Ingest one delivery and decide its disposition.
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        match self.gate.ingest(&delivery.payload).await {
            Ok(IngestOutcome::Started {
                business_ref,
                process_instance_id,
            }) => {
                tracing::debug!(
                    business_ref = %business_ref,
                    process_instance_id = %process_instance_id,
                    attempt = delivery.attempt,
                    "Delivery ingested"
                );
                Disposition::Ack
            }
            Ok(IngestOutcome::Duplicate { .. }) => Disposition::Ack,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    key = %delivery.key,
                    attempt = delivery.attempt,
                    error = %e,
                    "Ingestion failed, scheduling redelivery"
                );
                Disposition::Redeliver
            }
            Err(e) => {
                if !e.is_dead_letter() {
                    tracing::error!(
                        key = %delivery.key,
                        error_kind = e.kind(),
                        error = %e,
                        "Ingestion failed permanently"
                    );
                }
                self.dead_letter(delivery, &e).await
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, err: &OnboardingError) -> Disposition {
        let reason = err.to_string();
        let letter = DeadLetter {
            source: DeadLetterSource::Ingestion,
            reason: reason.clone(),
            payload: delivery.payload.clone(),
            received_at: Utc::now(),
        };
        match self.dead_letters.put(letter).await {
            Ok(()) => {
                tracing::warn!(
                    key = %delivery.key,
                    error_kind = err.kind(),
                    reason = %reason,
                    "Delivery dead-lettered"
                );
                Disposition::DeadLetter(reason)
            }
            Err(sink_err) => {
                // Never drop a message the sink could not take.
                tracing::error!(
                    key = %delivery.key,
                    error = %sink_err,
                    "Dead-letter sink unavailable, redelivering"
                );
                Disposition::Redeliver
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_reads_business_ref() {
        assert_eq!(partition_key(br#"{"caf_ref_no":" CAF-1 ","plan_code":"P"}"#), "CAF-1");
        assert_eq!(partition_key(b"garbage"), "");
        assert_eq!(partition_key(br#"{"caf_ref_no":7}"#), "");
    }

    #[tokio::test]
    async fn test_same_key_same_lane() {
        let (publisher, _sources) = partitioned_channels(8, 16, Duration::from_millis(1));
        let lane = publisher.lane_for("CAF-1");
        for _ in 0..10 {
            assert_eq!(publisher.lane_for("CAF-1"), lane);
        }
        assert_eq!(publisher.lane_count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_precedes_queued_messages() {
        let (publisher, mut sources) = partitioned_channels(1, 16, Duration::from_millis(500));
        let mut source = sources.remove(0);

        publisher.publish("A", b"first".to_vec()).await.unwrap();
        publisher.publish("A", b"second".to_vec()).await.unwrap();

        let first = source.next().await.unwrap();
        assert_eq!(first.payload, b"first");
        source.settle(first, Disposition::Redeliver).await.unwrap();

        let again = source.next().await.unwrap();
        assert_eq!(again.payload, b"first");
        assert_eq!(again.attempt, 2);
        source.settle(again, Disposition::Ack).await.unwrap();

        let second = source.next().await.unwrap();
        assert_eq!(second.payload, b"second");
        assert_eq!(second.attempt, 1);
    }
}
