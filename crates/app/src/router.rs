use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::error;

use outreach_core::{
    compute_rates,
    types::{CampaignCounters, CampaignRates, InstanceStatus},
};
use outreach_storage::{Database, InstanceError};
use outreach_util::{OrphanConfig, WebhookConfig};

use crate::aggregator::{Clock, CounterAggregator};
use crate::orphan::OrphanQueue;
use crate::problem::ProblemResponse;
use crate::signature::ProviderRegistry;
use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    providers: Arc<ProviderRegistry>,
    aggregator: CounterAggregator,
    orphans: OrphanQueue,
    orphan_config: OrphanConfig,
    webhook_deadline: Duration,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhooks: &WebhookConfig,
        orphans: &OrphanConfig,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let aggregator = CounterAggregator::new(storage.clone(), clock.clone());
        let orphan_queue =
            OrphanQueue::new(storage.clone(), aggregator.clone(), orphans, clock.clone());
        Self {
            metrics,
            providers: Arc::new(ProviderRegistry::from_config(webhooks)),
            storage,
            aggregator,
            orphans: orphan_queue,
            orphan_config: orphans.clone(),
            webhook_deadline: webhooks.deadline,
            clock,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.aggregator = CounterAggregator::new(self.storage.clone(), clock.clone());
        self.orphans = OrphanQueue::new(
            self.storage.clone(),
            self.aggregator.clone(),
            &self.orphan_config,
            clock.clone(),
        );
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn aggregator(&self) -> &CounterAggregator {
        &self.aggregator
    }

    pub fn orphans(&self) -> &OrphanQueue {
        &self.orphans
    }

    pub fn orphan_config(&self) -> &OrphanConfig {
        &self.orphan_config
    }

    pub fn webhook_deadline(&self) -> Duration {
        self.webhook_deadline
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/events/webhook/:provider", post(webhook::handle))
        .route("/campaigns/:instance_id/metrics", get(campaign_metrics))
        .route(
            "/internal/enrollments/:instance_id/:contact_id/created",
            post(enrollment_created),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

#[derive(Debug, Serialize)]
struct CampaignMetricsResponse {
    instance_id: String,
    status: InstanceStatus,
    counters: CampaignCounters,
    rates: CampaignRates,
}

async fn campaign_metrics(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<CampaignMetricsResponse>, ProblemResponse> {
    let instance = state
        .storage()
        .instances()
        .fetch(&instance_id)
        .await
        .map_err(|err| match err {
            InstanceError::NotFound => ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "instance_not_found",
                format!("campaign instance {instance_id} does not exist"),
            ),
            other => {
                error!(stage = "storage", %instance_id, error = %other, "failed to load campaign instance");
                ProblemResponse::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "failed to load campaign instance",
                )
            }
        })?;

    Ok(Json(CampaignMetricsResponse {
        rates: compute_rates(&instance.counters),
        instance_id: instance.id,
        status: instance.status,
        counters: instance.counters,
    }))
}

#[derive(Debug, Serialize)]
struct EnrollmentCreatedResponse {
    replayed: usize,
}

async fn enrollment_created(
    State(state): State<AppState>,
    Path((instance_id, contact_id)): Path<(String, String)>,
) -> Result<Response, ProblemResponse> {
    let replayed = state
        .orphans()
        .on_enrollment_created(&instance_id, &contact_id)
        .await
        .map_err(|err| {
            error!(stage = "orphan", %instance_id, %contact_id, error = %err, "enrollment hook failed");
            ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "failed to replay orphaned events",
            )
            .with_retry_after(5)
        })?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "enrollment_not_found",
                format!("enrollment {instance_id}/{contact_id} does not exist"),
            )
        })?;

    Ok((StatusCode::OK, Json(EnrollmentCreatedResponse { replayed })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::test_support::{memory_db, opened_event, seed_enrollment, seed_instance};

    async fn setup_state() -> AppState {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = memory_db().await;
        AppState::new(
            metrics,
            database,
            &WebhookConfig::default(),
            &OrphanConfig::default(),
        )
    }

    async fn body_json(response: Response) -> Value {
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        serde_json::from_slice(&collected.to_bytes()).expect("json body")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn campaign_metrics_reports_counters_and_rates() {
        let state = setup_state().await;
        let db = state.storage().clone();
        seed_instance(&db, "inst-1").await;
        sqlx::query(
            "UPDATE campaign_instances SET total_sent = 10, total_delivered = 8, total_opened = 4, \
             total_clicked = 1, total_replied = 2 WHERE id = 'inst-1'",
        )
        .execute(db.pool())
        .await
        .expect("set counters");

        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/campaigns/inst-1/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "active");
        assert_eq!(body["counters"]["total_delivered"], 8);
        assert_eq!(body["rates"]["delivery_rate"], 0.8);
        assert_eq!(body["rates"]["open_rate"], 0.5);
        assert_eq!(body["rates"]["click_rate"], 0.25);
        assert_eq!(body["rates"]["reply_rate"], 0.25);
    }

    #[tokio::test]
    async fn fresh_campaign_has_zero_rates() {
        let state = setup_state().await;
        seed_instance(state.storage(), "inst-empty").await;

        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/campaigns/inst-empty/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        let body = body_json(response).await;
        for rate in ["delivery_rate", "open_rate", "click_rate", "reply_rate"] {
            assert_eq!(body["rates"][rate], 0.0, "{rate}");
        }
    }

    #[tokio::test]
    async fn campaign_metrics_unknown_instance_is_not_found() {
        let app = app_router(setup_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/campaigns/missing/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn enrollment_created_hook_replays_parked_events() {
        let state = setup_state().await;
        let db = state.storage().clone();
        seed_instance(&db, "inst-1").await;
        state
            .orphans()
            .enqueue(&opened_event("act-9", "inst-1", "hana@example.com"))
            .await
            .expect("enqueue");
        seed_enrollment(&db, "enr-hana", "inst-1", "hana", "hana@example.com", None).await;

        let app = app_router(state);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/internal/enrollments/inst-1/hana/created")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["replayed"], 1);

        let missing = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/internal/enrollments/inst-1/nobody/created")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let instance = db.instances().fetch("inst-1").await.expect("fetch");
        assert_eq!(instance.counters.total_opened, 1);
    }
}
