use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use outreach_core::normalizer::Normalizer;
use outreach_core::types::{InboundEvent, ProviderKind};
use outreach_storage::EnrollmentError;

use crate::aggregator::{AggregateError, AggregationResult};
use crate::orphan::OrphanQueueError;
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::signature::SignatureVerifier;

const RETRY_AFTER_SECS: u32 = 5;

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
}

enum Ingested {
    Aggregated(AggregationResult),
    Orphaned,
}

#[derive(Debug, Error)]
enum IngestError {
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Orphan(#[from] OrphanQueueError),
}

pub async fn handle(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();

    let resolved = provider_name
        .parse::<ProviderKind>()
        .ok()
        .and_then(|provider| state.providers().get(provider).map(|v| (provider, v)));
    let Some((provider, verifier)) = resolved else {
        warn!(stage = "ingress", provider = %provider_name, "webhook for unknown or disabled provider");
        return Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            format!("provider '{provider_name}' is not enabled"),
        ));
    };

    let result = process(&state, provider, verifier, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds", "provider" => provider.as_str())
        .record(start.elapsed().as_secs_f64());
    result
}

async fn process(
    state: &AppState,
    provider: ProviderKind,
    verifier: &SignatureVerifier,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ProblemResponse> {
    let label = provider.as_str();

    verifier.verify(headers, body).map_err(|err| {
        counter!("webhook_invalid_signature_total", "provider" => label).increment(1);
        warn!(stage = "ingress", provider = label, error = %err, "webhook authentication failed");
        ProblemResponse::new(StatusCode::UNAUTHORIZED, "invalid_signature", err.to_string())
    })?;

    counter!("webhook_ingress_total", "provider" => label).increment(1);

    let payload: Value = serde_json::from_slice(body).map_err(|err| {
        reject(
            provider,
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    let event = Normalizer::normalize(provider, &payload, state.now()).map_err(|err| {
        reject(
            provider,
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            err.to_string(),
        )
    })?;

    let ingested = match timeout(state.webhook_deadline(), ingest(state, &event)).await {
        Ok(Ok(ingested)) => ingested,
        Ok(Err(err)) => {
            error!(
                stage = "ingress",
                provider = label,
                provider_event_id = %event.provider_event_id,
                error = %err,
                "failed to persist webhook event"
            );
            return Err(reject(
                provider,
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "failed to persist webhook event".to_string(),
            )
            .with_retry_after(RETRY_AFTER_SECS));
        }
        Err(_) => {
            warn!(
                stage = "ingress",
                provider = label,
                provider_event_id = %event.provider_event_id,
                deadline_ms = state.webhook_deadline().as_millis() as u64,
                "webhook processing exceeded deadline"
            );
            return Err(reject(
                provider,
                StatusCode::SERVICE_UNAVAILABLE,
                "deadline_exceeded",
                "webhook processing exceeded its deadline".to_string(),
            )
            .with_retry_after(RETRY_AFTER_SECS));
        }
    };

    let response = match ingested {
        Ingested::Aggregated(result) => IngestResponse {
            status: result.outcome.as_str(),
            event_id: Some(result.event_id),
        },
        Ingested::Orphaned => IngestResponse {
            status: "orphaned",
            event_id: None,
        },
    };

    info!(
        stage = "ingress",
        provider = label,
        provider_event_id = %event.provider_event_id,
        event_type = event.event_type.as_str(),
        status = response.status,
        "webhook processed"
    );

    Ok((StatusCode::CREATED, Json(response)).into_response())
}

async fn ingest(state: &AppState, event: &InboundEvent) -> Result<Ingested, IngestError> {
    let enrollment = state
        .storage()
        .enrollments()
        .find_by_key(&event.lookup_key)
        .await?;

    match enrollment {
        Some(enrollment) => {
            let result = state.aggregator().apply(event, &enrollment).await?;
            Ok(Ingested::Aggregated(result))
        }
        None => {
            state.orphans().enqueue(event).await?;
            Ok(Ingested::Orphaned)
        }
    }
}

fn reject(
    provider: ProviderKind,
    status: StatusCode,
    reason: &'static str,
    detail: String,
) -> ProblemResponse {
    counter!(
        "webhook_rejected_total",
        "provider" => provider.as_str(),
        "reason" => reason
    )
    .increment(1);
    if status.is_client_error() {
        warn!(stage = "normalizer", provider = provider.as_str(), reason, %detail, "webhook payload rejected");
    }
    ProblemResponse::new(status, reason, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, HeaderValue, Method, Request},
    };
    use chrono::{SecondsFormat, Utc};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use outreach_storage::Database;
    use outreach_util::{OrphanConfig, WebhookConfig};

    use crate::signature::tests::{base64_signature, hex_signature};
    use crate::signature::{LEMLIST_SIGNATURE_HEADER, POSTMARK_SIGNATURE_HEADER};
    use crate::test_support::{file_db, fixed_clock, memory_db, seed_enrollment, seed_instance};
    use crate::{router::app_router, telemetry};

    const LEMLIST_SECRET: &str = "lemlist-secret";
    const POSTMARK_SECRET: &str = "postmark-secret";
    const PHANTOMBUSTER_TOKEN: &str = "pb-token";

    struct TestContext {
        state: AppState,
        database: Database,
    }

    fn webhook_config() -> WebhookConfig {
        WebhookConfig {
            lemlist_secret: Some(LEMLIST_SECRET.to_string()),
            postmark_secret: Some(POSTMARK_SECRET.to_string()),
            phantombuster_token: Some(PHANTOMBUSTER_TOKEN.to_string()),
            ..WebhookConfig::default()
        }
    }

    async fn setup_context_with(config: WebhookConfig) -> TestContext {
        let metrics = telemetry::init_metrics().expect("metrics");
        let database = memory_db().await;
        seed_instance(&database, "inst-1").await;
        seed_enrollment(
            &database,
            "enr-1",
            "inst-1",
            "alice",
            "alice@example.com",
            Some("lead-1"),
        )
        .await;

        let state = AppState::new(
            metrics,
            database.clone(),
            &config,
            &OrphanConfig::default(),
        );
        TestContext { state, database }
    }

    async fn setup_context() -> TestContext {
        setup_context_with(webhook_config()).await
    }

    fn lemlist_body(id: &str, activity: &str, email: &str) -> String {
        json!({
            "_id": id,
            "type": activity,
            "createdAt": "2024-03-01T10:00:00.000Z",
            "leadEmail": email,
            "instanceId": "inst-1",
            "campaignName": "Q1 outbound",
        })
        .to_string()
    }

    async fn call_webhook(state: AppState, provider: &str, headers: HeaderMap, body: String) -> Response {
        let mut request_headers = headers;
        request_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(format!("/events/webhook/{provider}"))
            .body(Body::from(body))
            .expect("request");
        *request.headers_mut() = request_headers;

        app_router(state).oneshot(request).await.expect("response")
    }

    fn lemlist_headers(body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            LEMLIST_SIGNATURE_HEADER,
            HeaderValue::from_str(&hex_signature(LEMLIST_SECRET, body.as_bytes()))
                .expect("signature header"),
        );
        headers
    }

    fn phantombuster_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {PHANTOMBUSTER_TOKEN}")).expect("auth header"),
        );
        headers
    }

    async fn response_json(response: Response) -> Value {
        let collected = response.into_body().collect().await.expect("body");
        serde_json::from_slice(&collected.to_bytes()).expect("json")
    }

    async fn event_count(database: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM campaign_events")
            .fetch_one(database.pool())
            .await
            .expect("count events")
    }

    #[tokio::test]
    async fn signed_event_is_applied_and_redelivery_is_duplicate() {
        let ctx = setup_context().await;
        let body = lemlist_body("act-1", "emailsOpened", "Alice@Example.com");

        let first = call_webhook(ctx.state.clone(), "lemlist", lemlist_headers(&body), body.clone()).await;
        assert_eq!(first.status(), StatusCode::CREATED);
        let first_json = response_json(first).await;
        assert_eq!(first_json["status"], "applied");
        let event_id = first_json["event_id"].as_str().expect("event id").to_string();

        let second = call_webhook(ctx.state.clone(), "lemlist", lemlist_headers(&body), body).await;
        assert_eq!(second.status(), StatusCode::CREATED);
        let second_json = response_json(second).await;
        assert_eq!(second_json["status"], "duplicate");
        assert_eq!(second_json["event_id"], event_id.as_str());

        let instance = ctx.database.instances().fetch("inst-1").await.expect("fetch");
        assert_eq!(instance.counters.total_opened, 1);
        assert_eq!(event_count(&ctx.database).await, 1);

        let stored = ctx
            .database
            .campaign_events()
            .fetch_by_provider_id("lemlist", "act-1")
            .await
            .expect("fetch")
            .expect("stored");
        assert_eq!(stored.provider_data["campaignName"], "Q1 outbound");
        assert_eq!(
            stored.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "2024-03-01T10:00:00.000Z"
        );
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_without_side_effects() {
        let ctx = setup_context().await;
        let signed = lemlist_body("act-2", "emailsOpened", "alice@example.com");
        let tampered = lemlist_body("act-2", "emailsClicked", "alice@example.com");

        let response = call_webhook(ctx.state.clone(), "lemlist", lemlist_headers(&signed), tampered).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "application/problem+json"
        );
        let body = response_json(response).await;
        assert_eq!(body["type"], "invalid_signature");

        let missing = call_webhook(
            ctx.state.clone(),
            "lemlist",
            HeaderMap::new(),
            lemlist_body("act-3", "emailsOpened", "alice@example.com"),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(event_count(&ctx.database).await, 0);
        let instance = ctx.database.instances().fetch("inst-1").await.expect("fetch");
        assert_eq!(instance.counters, Default::default());
    }

    #[tokio::test]
    async fn unknown_and_unconfigured_providers_are_not_found() {
        let ctx = setup_context_with(WebhookConfig {
            lemlist_secret: Some(LEMLIST_SECRET.to_string()),
            ..WebhookConfig::default()
        })
        .await;

        let unknown = call_webhook(ctx.state.clone(), "mailchimp", HeaderMap::new(), "{}".to_string()).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let disabled = call_webhook(ctx.state.clone(), "postmark", HeaderMap::new(), "{}".to_string()).await;
        assert_eq!(disabled.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_payloads_are_bad_requests() {
        let ctx = setup_context().await;

        let not_json = "{not json".to_string();
        let response = call_webhook(ctx.state.clone(), "lemlist", lemlist_headers(&not_json), not_json).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["type"], "invalid_json");

        let no_type = json!({ "_id": "act-4", "leadEmail": "alice@example.com", "instanceId": "inst-1" })
            .to_string();
        let response = call_webhook(ctx.state.clone(), "lemlist", lemlist_headers(&no_type), no_type).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["type"], "invalid_payload");

        let no_reference = json!({ "_id": "act-5", "type": "emailsOpened" }).to_string();
        let response = call_webhook(
            ctx.state.clone(),
            "lemlist",
            lemlist_headers(&no_reference),
            no_reference,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert_eq!(event_count(&ctx.database).await, 0);
    }

    #[tokio::test]
    async fn event_without_enrollment_is_parked() {
        let ctx = setup_context().await;
        let now = Utc::now();
        let state = ctx.state.clone().with_clock(fixed_clock(now));
        let body = lemlist_body("act-6", "emailsDelivered", "newcomer@example.com");

        let response = call_webhook(state, "lemlist", lemlist_headers(&body), body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = response_json(response).await;
        assert_eq!(json["status"], "orphaned");
        assert!(json.get("event_id").is_none());

        let parked = ctx
            .database
            .orphans()
            .list_pending(now, 10)
            .await
            .expect("pending");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].lookup_key, "email:inst-1:newcomer@example.com");
        assert_eq!(
            (parked[0].expires_at - parked[0].first_seen_at).num_hours(),
            24
        );
        assert_eq!(event_count(&ctx.database).await, 0);
    }

    #[tokio::test]
    async fn postmark_delivery_is_verified_with_base64_signature() {
        let ctx = setup_context().await;
        let body = json!({
            "RecordType": "Delivery",
            "MessageID": "msg-1",
            "Recipient": "alice@example.com",
            "DeliveredAt": "2024-03-01T10:00:00Z",
            "Metadata": { "instance_id": "inst-1" },
        })
        .to_string();
        let mut headers = HeaderMap::new();
        headers.insert(
            POSTMARK_SIGNATURE_HEADER,
            HeaderValue::from_str(&base64_signature(POSTMARK_SECRET, body.as_bytes()))
                .expect("signature header"),
        );

        let response = call_webhook(ctx.state.clone(), "postmark", headers, body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response_json(response).await["status"], "applied");

        let instance = ctx.database.instances().fetch("inst-1").await.expect("fetch");
        assert_eq!(instance.counters.total_delivered, 1);
    }

    #[tokio::test]
    async fn phantombuster_connection_event_is_audit_only() {
        let ctx = setup_context().await;
        let body = json!({
            "eventId": "pb-1",
            "event": "connection_sent",
            "timestamp": "2024-03-01T10:00:00Z",
            "leadId": "lead-1",
        })
        .to_string();

        let response =
            call_webhook(ctx.state.clone(), "phantombuster", phantombuster_headers(), body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response_json(response).await["status"], "audit_only");

        assert_eq!(event_count(&ctx.database).await, 1);
        let instance = ctx.database.instances().fetch("inst-1").await.expect("fetch");
        assert_eq!(instance.counters, Default::default());
    }

    #[tokio::test]
    async fn lead_enrolled_in_two_instances_is_counted_on_the_named_one() {
        let ctx = setup_context().await;
        seed_instance(&ctx.database, "inst-2").await;
        seed_enrollment(
            &ctx.database,
            "enr-2",
            "inst-2",
            "alice",
            "alice@example.com",
            Some("lead-1"),
        )
        .await;
        sqlx::query("UPDATE campaign_enrollments SET enrolled_at = '2024-02-01T00:00:00.000Z' WHERE id = 'enr-2'")
            .execute(ctx.database.pool())
            .await
            .expect("enroll later");

        let body = json!({
            "eventId": "pb-9",
            "event": "message_replied",
            "leadId": "lead-1",
            "instanceId": "inst-1",
        })
        .to_string();
        let response =
            call_webhook(ctx.state.clone(), "phantombuster", phantombuster_headers(), body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response_json(response).await["status"], "applied");

        let first = ctx.database.instances().fetch("inst-1").await.expect("fetch");
        let second = ctx.database.instances().fetch("inst-2").await.expect("fetch");
        assert_eq!(first.counters.total_replied, 1);
        assert_eq!(second.counters.total_replied, 0);

        let stored = ctx
            .database
            .campaign_events()
            .fetch_by_provider_id("phantombuster", "pb-9")
            .await
            .expect("fetch")
            .expect("event recorded");
        assert_eq!(stored.enrollment_id, "enr-1");
    }

    #[tokio::test]
    async fn exceeded_deadline_returns_service_unavailable() {
        let metrics = telemetry::init_metrics().expect("metrics");
        let (database, _dir) = file_db().await;
        seed_instance(&database, "inst-1").await;
        seed_enrollment(&database, "enr-1", "inst-1", "alice", "alice@example.com", None).await;
        let state = AppState::new(
            metrics,
            database.clone(),
            &WebhookConfig {
                deadline: Duration::from_millis(200),
                ..webhook_config()
            },
            &OrphanConfig::default(),
        );

        // Hold the write lock so the aggregation transaction has to wait.
        let mut blocker = database.begin().await.expect("begin");
        sqlx::query("UPDATE campaign_instances SET updated_at = updated_at WHERE id = 'inst-1'")
            .execute(&mut *blocker)
            .await
            .expect("take write lock");

        let body = lemlist_body("act-7", "emailsOpened", "alice@example.com");
        let response = call_webhook(state, "lemlist", lemlist_headers(&body), body).await;
        blocker.rollback().await.expect("release write lock");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).expect("retry-after"),
            "5"
        );
        assert_eq!(response_json(response).await["type"], "deadline_exceeded");
    }
}
