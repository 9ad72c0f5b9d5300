use std::{borrow::Cow, sync::Arc};

use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use outreach_core::types::{CampaignEnrollment, CounterField, InboundEvent};
use outreach_storage::{CampaignEventError, Database, InstanceError, NewCampaignEvent};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What happened to an event handed to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// Newly recorded and counted.
    Applied,
    /// Already recorded by an earlier delivery; nothing changed.
    Duplicate,
    /// Newly recorded, but the event type has no counter.
    AuditOnly,
}

impl AggregationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::AuditOnly => "audit_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationResult {
    pub outcome: AggregationOutcome,
    /// Id of the stored `campaign_events` row, the earlier one for duplicates.
    pub event_id: String,
    pub counter: Option<(CounterField, u64)>,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Event(#[from] CampaignEventError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Records events and keeps the campaign instance counters in step with them.
///
/// The dedup insert and the counter increment share one transaction, so an
/// event is counted exactly once no matter how often it is delivered.
#[derive(Clone)]
pub struct CounterAggregator {
    database: Database,
    clock: Clock,
}

impl CounterAggregator {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    /// Applies `event` for `enrollment` in its own transaction.
    pub async fn apply(
        &self,
        event: &InboundEvent,
        enrollment: &CampaignEnrollment,
    ) -> Result<AggregationResult, AggregateError> {
        let mut tx = self.database.begin().await?;
        let result = self.apply_in(&mut tx, event, enrollment).await?;
        tx.commit().await?;

        record_outcome(event, &result);
        Ok(result)
    }

    /// Applies `event` inside a caller-owned transaction. The caller commits
    /// and then reports the result through [`record_outcome`].
    pub async fn apply_in(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &InboundEvent,
        enrollment: &CampaignEnrollment,
    ) -> Result<AggregationResult, AggregateError> {
        let now = (self.clock)();
        let new_id = Uuid::new_v4().to_string();

        let insert = self
            .database
            .campaign_events()
            .insert_if_absent(
                tx,
                &NewCampaignEvent {
                    id: Cow::Borrowed(new_id.as_str()),
                    enrollment_id: &enrollment.id,
                    instance_id: &enrollment.instance_id,
                    event,
                    recorded_at: now,
                },
            )
            .await?;

        if insert.is_duplicate() {
            return Ok(AggregationResult {
                outcome: AggregationOutcome::Duplicate,
                event_id: insert.record.id,
                counter: None,
            });
        }

        let Some(field) = event.event_type.counter_field() else {
            return Ok(AggregationResult {
                outcome: AggregationOutcome::AuditOnly,
                event_id: insert.record.id,
                counter: None,
            });
        };

        let value = self
            .database
            .instances()
            .increment(tx, &enrollment.instance_id, field, now)
            .await?;

        Ok(AggregationResult {
            outcome: AggregationOutcome::Applied,
            event_id: insert.record.id,
            counter: Some((field, value)),
        })
    }
}

/// Emits logs and metrics for a committed aggregation.
pub fn record_outcome(event: &InboundEvent, result: &AggregationResult) {
    counter!(
        "campaign_events_recorded_total",
        "provider" => event.provider.as_str(),
        "outcome" => result.outcome.as_str()
    )
    .increment(1);

    match (result.outcome, result.counter) {
        (AggregationOutcome::Duplicate, _) => info!(
            stage = "aggregator",
            provider = event.provider.as_str(),
            provider_event_id = %event.provider_event_id,
            event_id = %result.event_id,
            "duplicate event ignored"
        ),
        (_, Some((field, value))) => {
            counter!("campaign_counter_increments_total", "counter" => field.column()).increment(1);
            debug!(
                stage = "aggregator",
                provider = event.provider.as_str(),
                event_type = event.event_type.as_str(),
                counter = field.column(),
                value,
                "counter incremented"
            );
        }
        _ => debug!(
            stage = "aggregator",
            provider = event.provider.as_str(),
            source_type = %event.source_type,
            event_type = event.event_type.as_str(),
            "event recorded without counter"
        ),
    }
}
