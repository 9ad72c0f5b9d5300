use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use outreach_core::types::{CampaignEnrollment, EnrollmentLookupKey, InboundEvent};
use outreach_storage::{
    Database, DeadLetter, EnrollmentError, NewOrphan, OrphanEnqueueOutcome, OrphanError,
    OrphanedEventEntry,
};
use outreach_util::OrphanConfig;

use crate::aggregator::{record_outcome, AggregateError, Clock, CounterAggregator};

#[derive(Debug, Error)]
pub enum OrphanQueueError {
    #[error(transparent)]
    Orphan(#[from] OrphanError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outcome of one pass over the pending orphans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub replayed: usize,
    pub still_pending: usize,
    /// Entries whose attempt hit a storage error; they are retried next pass.
    pub failed: usize,
}

/// Durable holding area for events whose enrollment does not exist yet.
#[derive(Clone)]
pub struct OrphanQueue {
    database: Database,
    aggregator: CounterAggregator,
    ttl: ChronoDuration,
    max_attempts: u32,
    batch_limit: u32,
    clock: Clock,
}

impl OrphanQueue {
    pub fn new(
        database: Database,
        aggregator: CounterAggregator,
        config: &OrphanConfig,
        clock: Clock,
    ) -> Self {
        Self {
            database,
            aggregator,
            ttl: to_chrono(config.ttl),
            max_attempts: config.max_attempts,
            batch_limit: config.batch_limit,
            clock,
        }
    }

    /// Parks `event` until its enrollment appears or the TTL runs out.
    pub async fn enqueue(&self, event: &InboundEvent) -> Result<OrphanEnqueueOutcome, OrphanQueueError> {
        let now = (self.clock)();
        let outcome = self
            .database
            .orphans()
            .enqueue(&NewOrphan {
                id: Uuid::new_v4().to_string(),
                event,
                first_seen_at: now,
                expires_at: now + self.ttl,
            })
            .await?;

        match outcome {
            OrphanEnqueueOutcome::Parked => {
                counter!("orphan_enqueued_total", "provider" => event.provider.as_str()).increment(1);
                debug!(
                    stage = "orphan",
                    provider = event.provider.as_str(),
                    provider_event_id = %event.provider_event_id,
                    lookup_key = %event.lookup_key,
                    "enrollment not found; event parked"
                );
            }
            OrphanEnqueueOutcome::AlreadyParked => debug!(
                stage = "orphan",
                provider = event.provider.as_str(),
                provider_event_id = %event.provider_event_id,
                "event already parked"
            ),
        }

        Ok(outcome)
    }

    /// Replays every parked event for `lookup_key` if the enrollment now resolves.
    ///
    /// Returns how many entries this call removed from the queue.
    pub async fn try_resolve_and_replay(
        &self,
        lookup_key: &EnrollmentLookupKey,
    ) -> Result<usize, OrphanQueueError> {
        let Some(enrollment) = self.database.enrollments().find_by_key(lookup_key).await? else {
            return Ok(0);
        };

        let entries = self.database.orphans().list_for_key(lookup_key).await?;
        let mut replayed = 0;
        for entry in entries {
            if self.replay_entry(&entry, &enrollment).await? {
                replayed += 1;
            }
        }

        if replayed > 0 {
            info!(
                stage = "orphan",
                lookup_key = %lookup_key,
                enrollment_id = %enrollment.id,
                replayed,
                "orphaned events replayed"
            );
        }
        Ok(replayed)
    }

    /// Moves expired or exhausted entries to the dead-letter log.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<DeadLetter>, OrphanQueueError> {
        let dead_letters = self
            .database
            .orphans()
            .dead_letter_expired(now, self.max_attempts)
            .await?;

        for dead_letter in &dead_letters {
            counter!("orphan_dead_lettered_total", "reason" => dead_letter.reason.clone())
                .increment(1);
            error!(
                stage = "orphan",
                provider = %dead_letter.provider,
                provider_event_id = %dead_letter.provider_event_id,
                lookup_key = %dead_letter.lookup_key,
                reason = %dead_letter.reason,
                attempt_count = dead_letter.attempt_count,
                first_seen_at = %dead_letter.first_seen_at.to_rfc3339(),
                raw_event = %dead_letter.raw_event,
                "orphaned event dead-lettered"
            );
        }

        Ok(dead_letters)
    }

    /// Attempts resolution for a bounded batch of unexpired entries.
    ///
    /// A failing entry is logged and counted; the rest of the batch still runs.
    pub async fn reconcile_pending(&self, now: DateTime<Utc>) -> Result<ReconcileReport, OrphanQueueError> {
        let entries = self
            .database
            .orphans()
            .list_pending(now, self.batch_limit)
            .await?;

        let mut report = ReconcileReport {
            examined: entries.len(),
            ..ReconcileReport::default()
        };

        for entry in entries {
            match self.reconcile_entry(&entry, now).await {
                Ok(true) => report.replayed += 1,
                Ok(false) => report.still_pending += 1,
                Err(err) => {
                    report.failed += 1;
                    error!(
                        stage = "orphan",
                        orphan_id = %entry.id,
                        provider = %entry.provider,
                        provider_event_id = %entry.provider_event_id,
                        error = %err,
                        "orphan reconcile attempt failed"
                    );
                    counter!("orphan_reconcile_failures_total").increment(1);
                    if let Err(err) = self.database.orphans().record_attempt(&entry.id, now).await {
                        warn!(stage = "orphan", orphan_id = %entry.id, error = %err, "failed to record orphan attempt");
                    }
                }
            }
        }

        Ok(report)
    }

    /// `true` when this call replayed and removed the entry.
    async fn reconcile_entry(
        &self,
        entry: &OrphanedEventEntry,
        now: DateTime<Utc>,
    ) -> Result<bool, OrphanQueueError> {
        let event = match entry.event() {
            Ok(event) => event,
            Err(err) => {
                warn!(stage = "orphan", orphan_id = %entry.id, error = %err, "undecodable orphan left to expire");
                self.database.orphans().record_attempt(&entry.id, now).await?;
                return Ok(false);
            }
        };

        match self.database.enrollments().find_by_key(&event.lookup_key).await? {
            Some(enrollment) => self.replay_entry(entry, &enrollment).await,
            None => {
                self.database.orphans().record_attempt(&entry.id, now).await?;
                Ok(false)
            }
        }
    }

    /// Hook for the enrollment subsystem. `None` when the enrollment does not exist.
    pub async fn on_enrollment_created(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<usize>, OrphanQueueError> {
        let Some(enrollment) = self.database.enrollments().fetch(instance_id, contact_id).await? else {
            return Ok(None);
        };

        let mut replayed = 0;
        for key in EnrollmentLookupKey::candidates_for(&enrollment) {
            replayed += self.try_resolve_and_replay(&key).await?;
        }
        Ok(Some(replayed))
    }

    async fn replay_entry(
        &self,
        entry: &OrphanedEventEntry,
        enrollment: &CampaignEnrollment,
    ) -> Result<bool, OrphanQueueError> {
        let event = entry.event()?;

        let mut tx = self.database.begin().await?;
        let result = self.aggregator.apply_in(&mut tx, &event, enrollment).await?;
        let removed = self.database.orphans().remove(&mut tx, &entry.id).await?;
        tx.commit().await?;

        if removed {
            record_outcome(&event, &result);
            counter!("orphan_replayed_total").increment(1);
        }
        Ok(removed)
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}
