use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;

use outreach_core::types::{
    CampaignEnrollment, Channel, EnrollmentLookupKey, EventType, InboundEvent, ProviderKind,
};
use outreach_storage::Database;
use outreach_util::{DatabaseConfig, IsolationLevel};

use crate::aggregator::Clock;

pub async fn memory_db() -> Database {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    db.run_migrations().await.expect("migrations");
    db
}

/// File-backed database for tests that write from several connections at once.
pub async fn file_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("outreach-test.db");
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", path.display()),
        max_connections: 8,
        busy_timeout: Duration::from_secs(30),
        isolation: IsolationLevel::Serializable,
    };
    let db = Database::connect_with(&config).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    (db, dir)
}

pub async fn seed_instance(db: &Database, id: &str) {
    sqlx::query(
        "INSERT INTO campaign_instances (id, template_id, status, created_at, updated_at) \
         VALUES (?, 'tpl-1', 'active', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
    )
    .bind(id)
    .execute(db.pool())
    .await
    .expect("insert instance");
}

pub async fn seed_enrollment(
    db: &Database,
    id: &str,
    instance_id: &str,
    contact_id: &str,
    email: &str,
    external_ref: Option<&str>,
) -> CampaignEnrollment {
    sqlx::query(
        "INSERT INTO campaign_enrollments (id, instance_id, contact_id, contact_email, external_ref, status, enrolled_at) \
         VALUES (?, ?, ?, ?, ?, 'active', '2024-01-01T00:00:00.000Z')",
    )
    .bind(id)
    .bind(instance_id)
    .bind(contact_id)
    .bind(email)
    .bind(external_ref)
    .execute(db.pool())
    .await
    .expect("insert enrollment");

    db.enrollments()
        .fetch(instance_id, contact_id)
        .await
        .expect("fetch enrollment")
        .expect("enrollment exists")
}

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub fn fixed_clock(now: DateTime<Utc>) -> Clock {
    Arc::new(move || now)
}

pub fn opened_event(provider_event_id: &str, instance_id: &str, email: &str) -> InboundEvent {
    InboundEvent {
        event_type: EventType::Opened,
        source_type: "emailsOpened".to_string(),
        channel: Channel::Email,
        occurred_at: Utc::now(),
        provider: ProviderKind::Lemlist,
        provider_event_id: provider_event_id.to_string(),
        lookup_key: EnrollmentLookupKey::contact_email(instance_id, email),
        provider_data: json!({
            "_id": provider_event_id,
            "type": "emailsOpened",
            "leadEmail": email,
            "instanceId": instance_id,
        }),
    }
}
