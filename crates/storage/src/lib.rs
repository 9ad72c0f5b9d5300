use std::{borrow::Cow, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use thiserror::Error;

use outreach_core::types::{
    CampaignCounters, CampaignEnrollment, CampaignEvent, CampaignInstance, CounterField,
    EnrollmentLookupKey, InboundEvent,
};
use outreach_util::{DatabaseConfig, IsolationLevel};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    isolation: IsolationLevel,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string
    /// using default pool settings.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let config = DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        };
        Self::connect_with(&config).await
    }

    /// Establishes the pool described by `config`.
    ///
    /// Pragmas are part of the connect options so every pooled connection gets
    /// them, not only the first one handed out.
    pub async fn connect_with(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(StorageError::Connect)?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self {
            pool,
            isolation: config.isolation,
        })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a transaction. Callers should issue a write first so the
    /// connection takes the writer lock up front.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle for reading and incrementing campaign instance counters.
    pub fn instances(&self) -> CampaignInstanceRepository {
        CampaignInstanceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a read-only handle over enrollments.
    pub fn enrollments(&self) -> EnrollmentRepository {
        EnrollmentRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the append-only campaign event log.
    pub fn campaign_events(&self) -> CampaignEventRepository {
        CampaignEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the orphaned event queue.
    pub fn orphans(&self) -> OrphanRepository {
        OrphanRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the orphan dead-letter log.
    pub fn dead_letters(&self) -> DeadLetterRepository {
        DeadLetterRepository {
            pool: self.pool.clone(),
        }
    }

    /// SQLite admits one writer at a time, so both levels run serialized.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for checked-out connections to return and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for campaign instances. Counter columns are only ever changed
/// through [`CampaignInstanceRepository::increment`].
#[derive(Clone)]
pub struct CampaignInstanceRepository {
    pool: SqlitePool,
}

impl CampaignInstanceRepository {
    /// Loads an instance together with its counters.
    pub async fn fetch(&self, instance_id: &str) -> Result<CampaignInstance, InstanceError> {
        let row = sqlx::query_as::<_, CampaignInstanceRow>(
            "SELECT id, template_id, status, total_sent, total_delivered, total_opened, \
                    total_clicked, total_bounced, total_replied, total_enrolled, \
                    started_at, paused_at, completed_at \
               FROM campaign_instances WHERE id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(InstanceError::NotFound)?;

        row.into_domain()
    }

    /// Increments one counter in place and returns its new value.
    pub async fn increment(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        instance_id: &str,
        field: CounterField,
        updated_at: DateTime<Utc>,
    ) -> Result<u64, InstanceError> {
        let column = field.column();
        let sql = format!(
            "UPDATE campaign_instances \
             SET {column} = {column} + 1, updated_at = ? \
             WHERE id = ? \
             RETURNING {column}"
        );
        let row = sqlx::query(&sql)
            .bind(to_rfc3339(updated_at))
            .bind(instance_id)
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Err(InstanceError::NotFound);
        };

        let value: i64 = row.get(column);
        Ok(value as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CampaignInstanceRow {
    id: String,
    template_id: String,
    status: String,
    total_sent: i64,
    total_delivered: i64,
    total_opened: i64,
    total_clicked: i64,
    total_bounced: i64,
    total_replied: i64,
    total_enrolled: i64,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl CampaignInstanceRow {
    fn into_domain(self) -> Result<CampaignInstance, InstanceError> {
        Ok(CampaignInstance {
            status: self.status.parse().map_err(InstanceError::Decode)?,
            id: self.id,
            template_id: self.template_id,
            counters: CampaignCounters {
                total_sent: self.total_sent as u64,
                total_delivered: self.total_delivered as u64,
                total_opened: self.total_opened as u64,
                total_clicked: self.total_clicked as u64,
                total_bounced: self.total_bounced as u64,
                total_replied: self.total_replied as u64,
                total_enrolled: self.total_enrolled as u64,
            },
            started_at: self.started_at,
            paused_at: self.paused_at,
            completed_at: self.completed_at,
        })
    }
}

/// Errors that can occur while reading or updating campaign instances.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("campaign instance not found")]
    NotFound,
    #[error("invalid campaign instance row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read-only access to enrollments created by the enrollment subsystem.
#[derive(Clone)]
pub struct EnrollmentRepository {
    pool: SqlitePool,
}

impl EnrollmentRepository {
    /// Resolves the enrollment an inbound event belongs to.
    pub async fn find_by_key(
        &self,
        key: &EnrollmentLookupKey,
    ) -> Result<Option<CampaignEnrollment>, EnrollmentError> {
        let row = match key {
            EnrollmentLookupKey::ContactEmail {
                instance_id,
                contact_email,
            } => {
                sqlx::query_as::<_, EnrollmentRow>(
                    "SELECT id, instance_id, contact_id, contact_email, external_ref, status, enrolled_at \
                       FROM campaign_enrollments \
                      WHERE instance_id = ? AND contact_email = ? COLLATE NOCASE \
                      ORDER BY enrolled_at ASC \
                      LIMIT 1",
                )
                .bind(instance_id)
                .bind(contact_email)
                .fetch_optional(&self.pool)
                .await?
            }
            EnrollmentLookupKey::ExternalRef {
                instance_id,
                external_ref,
            } => {
                sqlx::query_as::<_, EnrollmentRow>(
                    "SELECT id, instance_id, contact_id, contact_email, external_ref, status, enrolled_at \
                       FROM campaign_enrollments \
                      WHERE external_ref = ? AND (? IS NULL OR instance_id = ?) \
                      ORDER BY enrolled_at DESC \
                      LIMIT 1",
                )
                .bind(external_ref)
                .bind(instance_id)
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(EnrollmentRow::into_domain))
    }

    /// Loads an enrollment by its natural key.
    pub async fn fetch(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<CampaignEnrollment>, EnrollmentError> {
        let row = sqlx::query_as::<_, EnrollmentRow>(
            "SELECT id, instance_id, contact_id, contact_email, external_ref, status, enrolled_at \
               FROM campaign_enrollments \
              WHERE instance_id = ? AND contact_id = ?",
        )
        .bind(instance_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EnrollmentRow::into_domain))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EnrollmentRow {
    id: String,
    instance_id: String,
    contact_id: String,
    contact_email: String,
    external_ref: Option<String>,
    status: String,
    enrolled_at: DateTime<Utc>,
}

impl EnrollmentRow {
    fn into_domain(self) -> CampaignEnrollment {
        CampaignEnrollment {
            id: self.id,
            instance_id: self.instance_id,
            contact_id: self.contact_id,
            contact_email: self.contact_email,
            external_ref: self.external_ref,
            status: self.status,
            enrolled_at: self.enrolled_at,
        }
    }
}

/// Errors that can occur while resolving enrollments.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository responsible for the append-only `campaign_events` table.
#[derive(Clone)]
pub struct CampaignEventRepository {
    pool: SqlitePool,
}

impl CampaignEventRepository {
    /// Inserts the event unless `(provider, provider_event_id)` already exists.
    ///
    /// A unique-constraint violation means another delivery of the same
    /// provider event won; the stored record is returned with `inserted = false`.
    pub async fn insert_if_absent(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewCampaignEvent<'_>,
    ) -> Result<InsertOutcome, CampaignEventError> {
        let event = record.event;
        let provider_data = serde_json::to_string(&event.provider_data)
            .map_err(|err| CampaignEventError::Decode(err.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO campaign_events \
             (id, enrollment_id, instance_id, event_type, source_type, channel, occurred_at, \
              provider, provider_event_id, provider_data, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.as_ref())
        .bind(record.enrollment_id)
        .bind(record.instance_id)
        .bind(event.event_type.as_str())
        .bind(&event.source_type)
        .bind(event.channel.as_str())
        .bind(to_rfc3339(event.occurred_at))
        .bind(event.provider.as_str())
        .bind(&event.provider_event_id)
        .bind(&provider_data)
        .bind(to_rfc3339(record.recorded_at))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome {
                inserted: true,
                record: CampaignEvent {
                    id: record.id.to_string(),
                    enrollment_id: record.enrollment_id.to_string(),
                    instance_id: record.instance_id.to_string(),
                    event_type: event.event_type,
                    source_type: event.source_type.clone(),
                    channel: event.channel,
                    occurred_at: event.occurred_at,
                    provider: event.provider,
                    provider_event_id: event.provider_event_id.clone(),
                    provider_data: event.provider_data.clone(),
                    recorded_at: record.recorded_at,
                },
            }),
            Err(sqlx::Error::Database(db_err)) => {
                if let Some(code) = db_err.code() {
                    if code == Cow::Borrowed("2067") {
                        let existing = fetch_event_by_key(
                            &mut **tx,
                            event.provider.as_str(),
                            &event.provider_event_id,
                        )
                        .await?
                        .ok_or(CampaignEventError::VanishedDuplicate)?;
                        return Ok(InsertOutcome {
                            inserted: false,
                            record: existing,
                        });
                    }
                    if code == Cow::Borrowed("787") {
                        return Err(CampaignEventError::MissingEnrollment);
                    }
                }

                Err(CampaignEventError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(CampaignEventError::Database(err)),
        }
    }

    /// Loads a stored event by its dedup key.
    pub async fn fetch_by_provider_id(
        &self,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<Option<CampaignEvent>, CampaignEventError> {
        let mut conn = self.pool.acquire().await?;
        fetch_event_by_key(&mut *conn, provider, provider_event_id).await
    }

    /// Counts events recorded for an instance.
    pub async fn count_for_instance(&self, instance_id: &str) -> Result<u64, CampaignEventError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM campaign_events WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

async fn fetch_event_by_key(
    conn: &mut SqliteConnection,
    provider: &str,
    provider_event_id: &str,
) -> Result<Option<CampaignEvent>, CampaignEventError> {
    let row = sqlx::query_as::<_, CampaignEventRow>(
        "SELECT id, enrollment_id, instance_id, event_type, source_type, channel, occurred_at, \
                provider, provider_event_id, provider_data, recorded_at \
           FROM campaign_events \
          WHERE provider = ? AND provider_event_id = ?",
    )
    .bind(provider)
    .bind(provider_event_id)
    .fetch_optional(conn)
    .await?;

    row.map(CampaignEventRow::into_domain).transpose()
}

/// Data required to append a new campaign event.
pub struct NewCampaignEvent<'a> {
    pub id: Cow<'a, str>,
    pub enrollment_id: &'a str,
    pub instance_id: &'a str,
    pub event: &'a InboundEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Result of [`CampaignEventRepository::insert_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub inserted: bool,
    pub record: CampaignEvent,
}

impl InsertOutcome {
    pub fn is_duplicate(&self) -> bool {
        !self.inserted
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CampaignEventRow {
    id: String,
    enrollment_id: String,
    instance_id: String,
    event_type: String,
    source_type: String,
    channel: String,
    occurred_at: DateTime<Utc>,
    provider: String,
    provider_event_id: String,
    provider_data: String,
    recorded_at: DateTime<Utc>,
}

impl CampaignEventRow {
    fn into_domain(self) -> Result<CampaignEvent, CampaignEventError> {
        Ok(CampaignEvent {
            event_type: self.event_type.parse().map_err(CampaignEventError::Decode)?,
            channel: self.channel.parse().map_err(CampaignEventError::Decode)?,
            provider: self.provider.parse().map_err(CampaignEventError::Decode)?,
            provider_data: serde_json::from_str(&self.provider_data)
                .map_err(|err| CampaignEventError::Decode(err.to_string()))?,
            id: self.id,
            enrollment_id: self.enrollment_id,
            instance_id: self.instance_id,
            source_type: self.source_type,
            occurred_at: self.occurred_at,
            provider_event_id: self.provider_event_id,
            recorded_at: self.recorded_at,
        })
    }
}

/// Error type for operations on the `campaign_events` repository.
#[derive(Debug, Error)]
pub enum CampaignEventError {
    #[error("enrollment is missing for incoming event")]
    MissingEnrollment,
    #[error("duplicate event could not be read back")]
    VanishedDuplicate,
    #[error("invalid campaign event row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable queue of events whose enrollment could not be resolved yet.
#[derive(Clone)]
pub struct OrphanRepository {
    pool: SqlitePool,
}

impl OrphanRepository {
    /// Parks an event. Redeliveries of an already-parked event are ignored.
    pub async fn enqueue(&self, record: &NewOrphan<'_>) -> Result<OrphanEnqueueOutcome, OrphanError> {
        let event = record.event;
        let raw_event = serde_json::to_string(event).map_err(OrphanError::Encode)?;

        let result = sqlx::query(
            "INSERT INTO orphaned_events \
             (id, provider, provider_event_id, lookup_key, raw_event, first_seen_at, attempt_count, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?) \
             ON CONFLICT(provider, provider_event_id) DO NOTHING",
        )
        .bind(&record.id)
        .bind(event.provider.as_str())
        .bind(&event.provider_event_id)
        .bind(event.lookup_key.storage_key())
        .bind(&raw_event)
        .bind(to_rfc3339(record.first_seen_at))
        .bind(to_rfc3339(record.expires_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(OrphanEnqueueOutcome::AlreadyParked)
        } else {
            Ok(OrphanEnqueueOutcome::Parked)
        }
    }

    /// Lists every parked event waiting on `lookup_key`.
    pub async fn list_for_key(
        &self,
        lookup_key: &EnrollmentLookupKey,
    ) -> Result<Vec<OrphanedEventEntry>, OrphanError> {
        let rows = sqlx::query_as::<_, OrphanedEventEntry>(
            "SELECT id, provider, provider_event_id, lookup_key, raw_event, first_seen_at, \
                    attempt_count, last_attempt_at, expires_at \
               FROM orphaned_events \
              WHERE lookup_key = ? \
              ORDER BY first_seen_at ASC",
        )
        .bind(lookup_key.storage_key())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Lists unexpired entries, oldest first.
    pub async fn list_pending(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OrphanedEventEntry>, OrphanError> {
        let rows = sqlx::query_as::<_, OrphanedEventEntry>(
            "SELECT id, provider, provider_event_id, lookup_key, raw_event, first_seen_at, \
                    attempt_count, last_attempt_at, expires_at \
               FROM orphaned_events \
              WHERE expires_at > ? \
              ORDER BY first_seen_at ASC \
              LIMIT ?",
        )
        .bind(to_rfc3339(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Records a failed resolution attempt, returning the new attempt count.
    pub async fn record_attempt(
        &self,
        id: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<Option<u32>, OrphanError> {
        let row = sqlx::query(
            "UPDATE orphaned_events \
             SET attempt_count = attempt_count + 1, last_attempt_at = ? \
             WHERE id = ? \
             RETURNING attempt_count",
        )
        .bind(to_rfc3339(attempted_at))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get::<i64, _>("attempt_count") as u32))
    }

    /// Removes an entry as part of the replay transaction.
    pub async fn remove(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
    ) -> Result<bool, OrphanError> {
        let result = sqlx::query("DELETE FROM orphaned_events WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Moves every expired or exhausted entry into `orphan_dead_letters`.
    ///
    /// The delete runs first and returns the rows it removed, so concurrent
    /// sweepers never dead-letter the same entry twice.
    pub async fn dead_letter_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetter>, OrphanError> {
        let mut tx = self.pool.begin().await?;
        let now_text = to_rfc3339(now);

        let expired = sqlx::query_as::<_, OrphanedEventEntry>(
            "DELETE FROM orphaned_events \
              WHERE expires_at <= ? OR attempt_count >= ? \
             RETURNING id, provider, provider_event_id, lookup_key, raw_event, first_seen_at, \
                       attempt_count, last_attempt_at, expires_at",
        )
        .bind(&now_text)
        .bind(i64::from(max_attempts))
        .fetch_all(&mut *tx)
        .await?;

        let mut dead_letters = Vec::with_capacity(expired.len());
        for entry in expired {
            let reason = if entry.expires_at <= now {
                DeadLetterReason::TtlExpired
            } else {
                DeadLetterReason::MaxAttemptsExceeded
            };
            let id = uuid::Uuid::new_v4().to_string();

            sqlx::query(
                "INSERT INTO orphan_dead_letters \
                 (id, orphan_id, provider, provider_event_id, lookup_key, raw_event, first_seen_at, \
                  attempt_count, reason, dead_lettered_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&entry.id)
            .bind(&entry.provider)
            .bind(&entry.provider_event_id)
            .bind(&entry.lookup_key)
            .bind(&entry.raw_event)
            .bind(to_rfc3339(entry.first_seen_at))
            .bind(entry.attempt_count)
            .bind(reason.as_str())
            .bind(&now_text)
            .execute(&mut *tx)
            .await?;

            dead_letters.push(DeadLetter {
                id,
                orphan_id: entry.id,
                provider: entry.provider,
                provider_event_id: entry.provider_event_id,
                lookup_key: entry.lookup_key,
                raw_event: entry.raw_event,
                first_seen_at: entry.first_seen_at,
                attempt_count: entry.attempt_count,
                reason: reason.as_str().to_string(),
                dead_lettered_at: now,
            });
        }

        tx.commit().await?;
        Ok(dead_letters)
    }
}

/// Parameters required to park an orphaned event.
pub struct NewOrphan<'a> {
    pub id: String,
    pub event: &'a InboundEvent,
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of attempting to park an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanEnqueueOutcome {
    Parked,
    AlreadyParked,
}

/// Row stored in `orphaned_events`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrphanedEventEntry {
    pub id: String,
    pub provider: String,
    pub provider_event_id: String,
    pub lookup_key: String,
    pub raw_event: String,
    pub first_seen_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl OrphanedEventEntry {
    /// Decodes the parked, already-normalized event.
    pub fn event(&self) -> Result<InboundEvent, OrphanError> {
        serde_json::from_str(&self.raw_event).map_err(OrphanError::Decode)
    }
}

/// Why an orphan was moved to the dead-letter log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    TtlExpired,
    MaxAttemptsExceeded,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TtlExpired => "ttl_expired",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
        }
    }
}

/// Errors that can occur while operating on the orphan queue.
#[derive(Debug, Error)]
pub enum OrphanError {
    #[error("failed to encode orphaned event: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode orphaned event: {0}")]
    Decode(serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Terminal log of orphans that never resolved.
#[derive(Clone)]
pub struct DeadLetterRepository {
    pool: SqlitePool,
}

impl DeadLetterRepository {
    /// Lists dead letters, newest first.
    pub async fn list(&self, limit: u32) -> Result<Vec<DeadLetter>, OrphanError> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            "SELECT id, orphan_id, provider, provider_event_id, lookup_key, raw_event, \
                    first_seen_at, attempt_count, reason, dead_lettered_at \
               FROM orphan_dead_letters \
              ORDER BY dead_lettered_at DESC \
              LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Row stored in `orphan_dead_letters`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: String,
    pub orphan_id: String,
    pub provider: String,
    pub provider_event_id: String,
    pub lookup_key: String,
    pub raw_event: String,
    pub first_seen_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn event(&self) -> Result<InboundEvent, OrphanError> {
        serde_json::from_str(&self.raw_event).map_err(OrphanError::Decode)
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
