use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outreach vendors able to deliver webhooks to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Lemlist,
    Postmark,
    Phantombuster,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Lemlist, Self::Postmark, Self::Phantombuster];

    /// Returns the canonical name used in URLs, storage and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lemlist => "lemlist",
            Self::Postmark => "postmark",
            Self::Phantombuster => "phantombuster",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "lemlist" => Ok(Self::Lemlist),
            "postmark" => Ok(Self::Postmark),
            "phantombuster" => Ok(Self::Phantombuster),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Delivery channel an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Linkedin,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Linkedin => "linkedin",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "email" => Ok(Self::Email),
            "linkedin" => Ok(Self::Linkedin),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Canonical, provider-agnostic event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Replied,
    Unsubscribed,
    ConnectionSent,
    ConnectionAccepted,
    ProfileVisited,
    MessageSent,
    Unmapped,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Replied => "replied",
            Self::Unsubscribed => "unsubscribed",
            Self::ConnectionSent => "connection_sent",
            Self::ConnectionAccepted => "connection_accepted",
            Self::ProfileVisited => "profile_visited",
            Self::MessageSent => "message_sent",
            Self::Unmapped => "unmapped",
        }
    }

    /// Counter column incremented by this event, or `None` for audit-only types.
    pub fn counter_field(self) -> Option<CounterField> {
        match self {
            Self::Sent => Some(CounterField::Sent),
            Self::Delivered => Some(CounterField::Delivered),
            Self::Opened => Some(CounterField::Opened),
            Self::Clicked => Some(CounterField::Clicked),
            Self::Bounced => Some(CounterField::Bounced),
            Self::Replied => Some(CounterField::Replied),
            Self::Unsubscribed
            | Self::ConnectionSent
            | Self::ConnectionAccepted
            | Self::ProfileVisited
            | Self::MessageSent
            | Self::Unmapped => None,
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = match value {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "opened" => Self::Opened,
            "clicked" => Self::Clicked,
            "bounced" => Self::Bounced,
            "replied" => Self::Replied,
            "unsubscribed" => Self::Unsubscribed,
            "connection_sent" => Self::ConnectionSent,
            "connection_accepted" => Self::ConnectionAccepted,
            "profile_visited" => Self::ProfileVisited,
            "message_sent" => Self::MessageSent,
            "unmapped" => Self::Unmapped,
            other => return Err(format!("unknown event type: {other}")),
        };
        Ok(parsed)
    }
}

/// Aggregate counters stored on a campaign instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Replied,
    Enrolled,
}

impl CounterField {
    /// Column name on `campaign_instances`. Only ever one of these literals reaches SQL.
    pub fn column(self) -> &'static str {
        match self {
            Self::Sent => "total_sent",
            Self::Delivered => "total_delivered",
            Self::Opened => "total_opened",
            Self::Clicked => "total_clicked",
            Self::Bounced => "total_bounced",
            Self::Replied => "total_replied",
            Self::Enrolled => "total_enrolled",
        }
    }
}

/// How an inbound event is matched to its enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrollmentLookupKey {
    ContactEmail {
        instance_id: String,
        contact_email: String,
    },
    ExternalRef {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        external_ref: String,
    },
}

impl EnrollmentLookupKey {
    pub fn contact_email(instance_id: impl Into<String>, email: &str) -> Self {
        Self::ContactEmail {
            instance_id: instance_id.into(),
            contact_email: email.trim().to_lowercase(),
        }
    }

    /// Provider-side lead id, scoped to `instance_id` when the payload names one.
    pub fn external_ref(instance_id: Option<&str>, external_ref: impl Into<String>) -> Self {
        Self::ExternalRef {
            instance_id: instance_id.map(str::to_owned),
            external_ref: external_ref.into(),
        }
    }

    /// Flat, indexable representation persisted alongside orphaned events.
    ///
    /// Parts are escaped so `:` only ever appears as a separator.
    pub fn storage_key(&self) -> String {
        match self {
            Self::ContactEmail {
                instance_id,
                contact_email,
            } => format!("email:{}:{}", key_part(instance_id), key_part(contact_email)),
            Self::ExternalRef {
                instance_id: Some(instance_id),
                external_ref,
            } => format!("ref:{}:{}", key_part(instance_id), key_part(external_ref)),
            Self::ExternalRef {
                instance_id: None,
                external_ref,
            } => format!("ref:{}", key_part(external_ref)),
        }
    }

    /// Every key under which events for `enrollment` may have been parked.
    pub fn candidates_for(enrollment: &CampaignEnrollment) -> Vec<Self> {
        let mut keys = vec![Self::contact_email(
            enrollment.instance_id.clone(),
            &enrollment.contact_email,
        )];
        if let Some(external_ref) = &enrollment.external_ref {
            keys.push(Self::external_ref(
                Some(enrollment.instance_id.as_str()),
                external_ref.clone(),
            ));
            keys.push(Self::external_ref(None, external_ref.clone()));
        }
        keys
    }
}

fn key_part(value: &str) -> String {
    value.replace('%', "%25").replace(':', "%3A")
}

impl fmt::Display for EnrollmentLookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Provider event normalized into the shape the rest of the pipeline works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_type: EventType,
    /// The provider's own name for the event, kept for audit of `unmapped` types.
    pub source_type: String,
    pub channel: Channel,
    pub occurred_at: DateTime<Utc>,
    pub provider: ProviderKind,
    pub provider_event_id: String,
    pub lookup_key: EnrollmentLookupKey,
    pub provider_data: Value,
}

impl InboundEvent {
    pub fn is_counted(&self) -> bool {
        self.event_type.counter_field().is_some()
    }
}

/// Lifecycle state of a campaign instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_opened: u64,
    pub total_clicked: u64,
    pub total_bounced: u64,
    pub total_replied: u64,
    pub total_enrolled: u64,
}

impl CampaignCounters {
    pub fn get(&self, field: CounterField) -> u64 {
        match field {
            CounterField::Sent => self.total_sent,
            CounterField::Delivered => self.total_delivered,
            CounterField::Opened => self.total_opened,
            CounterField::Clicked => self.total_clicked,
            CounterField::Bounced => self.total_bounced,
            CounterField::Replied => self.total_replied,
            CounterField::Enrolled => self.total_enrolled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CampaignRates {
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub reply_rate: f64,
}

/// A running campaign. Only the counters are written by this service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignInstance {
    pub id: String,
    pub template_id: String,
    pub status: InstanceStatus,
    pub counters: CampaignCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A recipient's participation in one campaign instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignEnrollment {
    pub id: String,
    pub instance_id: String,
    pub contact_id: String,
    pub contact_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    pub status: String,
    pub enrolled_at: DateTime<Utc>,
}

/// Immutable audit record of one provider event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignEvent {
    pub id: String,
    pub enrollment_id: String,
    pub instance_id: String,
    pub event_type: EventType,
    pub source_type: String,
    pub channel: Channel,
    pub occurred_at: DateTime<Utc>,
    pub provider: ProviderKind,
    pub provider_event_id: String,
    pub provider_data: Value,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_delivery_funnel_types_are_counted() {
        let counted: Vec<_> = [
            EventType::Sent,
            EventType::Delivered,
            EventType::Opened,
            EventType::Clicked,
            EventType::Bounced,
            EventType::Replied,
        ]
        .into_iter()
        .filter_map(EventType::counter_field)
        .collect();
        assert_eq!(counted.len(), 6);

        for audit_only in [
            EventType::Unsubscribed,
            EventType::ConnectionSent,
            EventType::ConnectionAccepted,
            EventType::ProfileVisited,
            EventType::MessageSent,
            EventType::Unmapped,
        ] {
            assert!(audit_only.counter_field().is_none(), "{audit_only:?}");
        }
    }

    #[test]
    fn event_type_names_parse_back() {
        for event_type in [EventType::ConnectionAccepted, EventType::Unmapped, EventType::Sent] {
            assert_eq!(event_type.as_str().parse::<EventType>(), Ok(event_type));
        }
    }

    #[test]
    fn lookup_keys_normalize_email_case() {
        let key = EnrollmentLookupKey::contact_email("inst-2", " Alice@Example.com ");
        assert_eq!(key.storage_key(), "email:inst-2:alice@example.com");
    }

    #[test]
    fn enrollment_candidates_include_external_ref() {
        let enrollment = CampaignEnrollment {
            id: "enr-1".to_string(),
            instance_id: "inst-1".to_string(),
            contact_id: "alice".to_string(),
            contact_email: "alice@example.com".to_string(),
            external_ref: Some("lead-9".to_string()),
            status: "active".to_string(),
            enrolled_at: Utc::now(),
        };

        let keys: Vec<String> = EnrollmentLookupKey::candidates_for(&enrollment)
            .iter()
            .map(EnrollmentLookupKey::storage_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "email:inst-1:alice@example.com",
                "ref:inst-1:lead-9",
                "ref:lead-9"
            ]
        );
    }

    #[test]
    fn storage_keys_escape_separators() {
        let colon_in_instance = EnrollmentLookupKey::contact_email("a:b", "c@example.com");
        let colon_in_email = EnrollmentLookupKey::contact_email("a", "b:c@example.com");
        assert_ne!(colon_in_instance.storage_key(), colon_in_email.storage_key());
        assert_eq!(colon_in_instance.storage_key(), "email:a%3Ab:c@example.com");

        let scoped = EnrollmentLookupKey::external_ref(Some("inst"), "lead");
        let unscoped = EnrollmentLookupKey::external_ref(None, "inst:lead");
        assert_ne!(scoped.storage_key(), unscoped.storage_key());
        assert_eq!(unscoped.storage_key(), "ref:inst%3Alead");
        assert_eq!(
            EnrollmentLookupKey::external_ref(None, "100%").storage_key(),
            "ref:100%25"
        );
    }
}
