use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Channel, EnrollmentLookupKey, EventType, InboundEvent, ProviderKind};

/// Errors that can occur during normalization of incoming webhook payloads.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to parse payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp for field '{field}': {source}")]
    InvalidTimestamp {
        field: &'static str,
        source: chrono::ParseError,
    },
}

/// Deterministic normalizer transforming provider JSON into [`InboundEvent`] values.
pub struct Normalizer;

impl Normalizer {
    /// Converts a raw provider payload into an [`InboundEvent`].
    ///
    /// `received_at` stands in for the occurrence time when the provider omits it.
    pub fn normalize(
        provider: ProviderKind,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<InboundEvent, NormalizerError> {
        if !payload.is_object() {
            return Err(NormalizerError::NotAnObject);
        }

        match provider {
            ProviderKind::Lemlist => Self::normalize_lemlist(payload, received_at),
            ProviderKind::Postmark => Self::normalize_postmark(payload, received_at),
            ProviderKind::Phantombuster => Self::normalize_phantombuster(payload, received_at),
        }
    }

    fn normalize_lemlist(
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<InboundEvent, NormalizerError> {
        let activity: LemlistActivity = serde_json::from_value(payload.clone())?;
        let source_type = activity
            .activity_type
            .ok_or(NormalizerError::MissingField("type"))?;

        let channel = if source_type.starts_with("linkedin") {
            Channel::Linkedin
        } else {
            Channel::Email
        };
        let event_type = match source_type.as_str() {
            "emailsSent" => EventType::Sent,
            "emailsDelivered" => EventType::Delivered,
            "emailsOpened" => EventType::Opened,
            "emailsClicked" => EventType::Clicked,
            "emailsBounced" => EventType::Bounced,
            "emailsReplied" | "linkedinReplied" => EventType::Replied,
            "emailsUnsubscribed" => EventType::Unsubscribed,
            "linkedinInviteDone" => EventType::ConnectionSent,
            "linkedinInviteAccepted" => EventType::ConnectionAccepted,
            "linkedinVisitDone" => EventType::ProfileVisited,
            "linkedinSent" => EventType::MessageSent,
            _ => EventType::Unmapped,
        };

        let occurred_at = parse_optional_timestamp("createdAt", activity.created_at, received_at)?;
        let lookup_key = resolve_lookup_key(
            activity.instance_id.as_deref(),
            activity.lead_email.as_deref(),
            activity.lead_id.as_deref(),
        )?;

        Ok(InboundEvent {
            event_type,
            source_type,
            channel,
            occurred_at,
            provider: ProviderKind::Lemlist,
            provider_event_id: activity
                .id
                .unwrap_or_else(|| synthesize_event_id(payload)),
            lookup_key,
            provider_data: payload.clone(),
        })
    }

    fn normalize_postmark(
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<InboundEvent, NormalizerError> {
        let record: PostmarkRecord = serde_json::from_value(payload.clone())?;
        let source_type = record
            .record_type
            .clone()
            .ok_or(NormalizerError::MissingField("RecordType"))?;

        let (event_type, timestamp_field, raw_time) = match source_type.as_str() {
            "Delivery" => (EventType::Delivered, "DeliveredAt", record.delivered_at),
            "Open" => (EventType::Opened, "ReceivedAt", record.received_at),
            "Click" => (EventType::Clicked, "ReceivedAt", record.received_at),
            "Bounce" => (EventType::Bounced, "BouncedAt", record.bounced_at),
            "SpamComplaint" => (EventType::Unsubscribed, "BouncedAt", record.bounced_at),
            "SubscriptionChange" => (EventType::Unsubscribed, "ChangedAt", record.changed_at),
            "Inbound" => (EventType::Replied, "Date", record.date),
            _ => (EventType::Unmapped, "ReceivedAt", record.received_at),
        };
        let occurred_at = parse_optional_timestamp(timestamp_field, raw_time, received_at)?;

        let metadata = record.metadata.unwrap_or_default();
        let (instance_id, contact_email) = if event_type == EventType::Replied {
            let sender = record
                .from_full
                .and_then(|address| address.email)
                .or(record.from);
            (
                record
                    .mailbox_hash
                    .filter(|hash| !hash.trim().is_empty())
                    .or(metadata.instance_id),
                sender,
            )
        } else {
            (metadata.instance_id, record.recipient.or(record.email))
        };
        let lookup_key = resolve_lookup_key(
            instance_id.as_deref(),
            contact_email.as_deref(),
            metadata.external_ref.as_deref(),
        )?;

        // Only bounce records carry an id that is unique per occurrence.
        let provider_event_id = match (event_type, record.id) {
            (EventType::Bounced, Some(id)) => scalar_to_string(&id),
            _ => None,
        }
        .unwrap_or_else(|| synthesize_event_id(payload));

        Ok(InboundEvent {
            event_type,
            source_type,
            channel: Channel::Email,
            occurred_at,
            provider: ProviderKind::Postmark,
            provider_event_id,
            lookup_key,
            provider_data: payload.clone(),
        })
    }

    fn normalize_phantombuster(
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<InboundEvent, NormalizerError> {
        let data: PhantombusterEvent = serde_json::from_value(payload.clone())?;
        let source_type = data.event.ok_or(NormalizerError::MissingField("event"))?;

        let event_type = match source_type.as_str() {
            "connection_sent" => EventType::ConnectionSent,
            "connection_accepted" => EventType::ConnectionAccepted,
            "profile_visited" => EventType::ProfileVisited,
            "message_sent" => EventType::MessageSent,
            "message_replied" => EventType::Replied,
            _ => EventType::Unmapped,
        };
        let occurred_at = parse_optional_timestamp("timestamp", data.timestamp, received_at)?;
        let lookup_key = resolve_lookup_key(
            data.instance_id.as_deref(),
            data.email.as_deref(),
            data.lead_id.as_deref(),
        )?;

        Ok(InboundEvent {
            event_type,
            source_type,
            channel: Channel::Linkedin,
            occurred_at,
            provider: ProviderKind::Phantombuster,
            provider_event_id: data
                .event_id
                .unwrap_or_else(|| synthesize_event_id(payload)),
            lookup_key,
            provider_data: payload.clone(),
        })
    }
}

/// Deterministic id for providers that do not send one: SHA-256 over the
/// payload with object keys sorted, so field order never changes the result.
pub fn synthesize_event_id(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_canonical(payload, &mut hasher);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn hash_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(Value::from(key.as_str()).to_string().as_bytes());
                hasher.update(b":");
                hash_canonical(&map[key], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

fn resolve_lookup_key(
    instance_id: Option<&str>,
    contact_email: Option<&str>,
    external_ref: Option<&str>,
) -> Result<EnrollmentLookupKey, NormalizerError> {
    fn non_empty(value: Option<&str>) -> Option<&str> {
        value.filter(|v| !v.trim().is_empty())
    }

    match (
        non_empty(instance_id),
        non_empty(contact_email),
        non_empty(external_ref),
    ) {
        (Some(instance_id), Some(email), _) => {
            Ok(EnrollmentLookupKey::contact_email(instance_id, email))
        }
        (instance_id, _, Some(external_ref)) => {
            Ok(EnrollmentLookupKey::external_ref(instance_id, external_ref))
        }
        _ => Err(NormalizerError::MissingField("enrollment reference")),
    }
}

fn parse_optional_timestamp(
    field: &'static str,
    raw: Option<String>,
    fallback: DateTime<Utc>,
) -> Result<DateTime<Utc>, NormalizerError> {
    let Some(raw) = raw else {
        return Ok(fallback);
    };

    DateTime::parse_from_rfc3339(&raw)
        .or_else(|_| DateTime::parse_from_rfc2822(&raw))
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| NormalizerError::InvalidTimestamp { field, source })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LemlistActivity {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    activity_type: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    lead_email: Option<String>,
    #[serde(default)]
    lead_id: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkRecord {
    #[serde(default)]
    record_type: Option<String>,
    #[serde(rename = "ID", default)]
    id: Option<Value>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    from_full: Option<PostmarkAddress>,
    #[serde(default)]
    mailbox_hash: Option<String>,
    #[serde(default)]
    metadata: Option<PostmarkMetadata>,
    #[serde(default)]
    delivered_at: Option<String>,
    #[serde(default)]
    received_at: Option<String>,
    #[serde(default)]
    bounced_at: Option<String>,
    #[serde(default)]
    changed_at: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkAddress {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PostmarkMetadata {
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    external_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhantombusterEvent {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    lead_id: Option<String>,
}
