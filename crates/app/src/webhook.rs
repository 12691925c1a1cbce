use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use shop_pulse_core::{signature, types::TopicFamily};
use shop_pulse_storage::{EventError, NewEvent};

use crate::ingest::IngestJob;
use crate::problem::ProblemResponse;
use crate::router::AppState;

pub const HEADER_SHOP_DOMAIN: &str = "X-Shopify-Shop-Domain";
pub const HEADER_TOPIC: &str = "X-Shopify-Topic";
pub const HEADER_SIGNATURE: &str = "X-Shopify-Hmac-Sha256";
pub const HEADER_WEBHOOK_ID: &str = "X-Shopify-Webhook-Id";

/// `POST /webhooks`: verify, resolve the tenant, persist the raw event and
/// acknowledge. Entity writes happen later on the ingest worker.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = accept(&state, &headers, &body).await;

    let topic_label = optional_header(&headers, HEADER_TOPIC)
        .map(|topic| TopicFamily::classify(topic).as_str())
        .unwrap_or("unknown");
    histogram!("webhook_ack_latency_seconds", "topic" => topic_label)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => Ok((StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], "ok").into_response()),
        Err(problem) => {
            counter!("webhook_rejected_total", "reason" => problem.problem_type()).increment(1);
            Err(problem)
        }
    }
}

async fn accept(state: &AppState, headers: &HeaderMap, body: &Bytes) -> Result<(), ProblemResponse> {
    if body.is_empty() {
        return Err(ProblemResponse::bad_request(
            "missing_body",
            "request body must not be empty",
        ));
    }
    let shop_domain = required_header(headers, HEADER_SHOP_DOMAIN)?;
    let topic = required_header(headers, HEADER_TOPIC)?;

    if state.signature_mode().is_bypassed() {
        warn!(stage = "ingress", shop_domain, topic, "signature check bypassed");
    } else {
        let provided = required_header(headers, HEADER_SIGNATURE)
            .map_err(|_| invalid_signature(shop_domain, topic))?;
        let secret = state.webhook_secret().unwrap_or_default();
        if !signature::verify(body, secret, provided) {
            return Err(invalid_signature(shop_domain, topic));
        }
    }

    let tenant = state
        .storage()
        .tenants()
        .find_by_domain(shop_domain)
        .await
        .map_err(|err| {
            error!(stage = "ingress", shop_domain, error = %err, "tenant lookup failed");
            ProblemResponse::storage_error("failed to resolve tenant")
        })?
        .ok_or_else(|| {
            warn!(stage = "ingress", shop_domain, topic, "webhook for unknown shop");
            ProblemResponse::not_found(
                "unknown_tenant",
                format!("no tenant is connected for {shop_domain}"),
            )
        })?;

    let body_text = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::bad_request("invalid_json", "request body must be valid UTF-8")
    })?;
    let payload: Value = serde_json::from_str(body_text).map_err(|err| {
        ProblemResponse::bad_request("invalid_json", format!("failed to parse payload: {err}"))
    })?;

    let event_id = Uuid::new_v4().to_string();
    let webhook_id = optional_header(headers, HEADER_WEBHOOK_ID);
    let outcome = state
        .storage()
        .events()
        .insert(NewEvent {
            id: &event_id,
            tenant_id: &tenant.id,
            webhook_id,
            topic,
            payload_json: body_text,
            received_at: state.now(),
        })
        .await
        .map_err(|err| {
            error!(stage = "ingress", shop_domain, topic, error = %err, "failed to persist event");
            match err {
                EventError::MissingTenant => ProblemResponse::not_found(
                    "unknown_tenant",
                    format!("no tenant is connected for {shop_domain}"),
                ),
                _ => ProblemResponse::storage_error("failed to persist webhook payload"),
            }
        })?;

    if outcome.is_duplicate() {
        info!(
            stage = "ingress",
            shop_domain,
            topic,
            webhook_id = webhook_id.unwrap_or_default(),
            "duplicate webhook delivery acknowledged"
        );
        return Ok(());
    }

    counter!("webhook_ingress_total", "topic" => TopicFamily::classify(topic).as_str())
        .increment(1);
    info!(
        stage = "ingress",
        %event_id,
        tenant_id = %tenant.id,
        topic,
        size_bytes = body.len(),
        "webhook persisted"
    );

    state.queue().enqueue(IngestJob {
        event_id,
        tenant_id: tenant.id,
        topic: topic.to_string(),
        payload,
    });
    Ok(())
}

fn invalid_signature(shop_domain: &str, topic: &str) -> ProblemResponse {
    warn!(stage = "ingress", shop_domain, topic, "webhook signature rejected");
    ProblemResponse::unauthorized("invalid_signature", "webhook signature verification failed")
}

fn required_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ProblemResponse> {
    optional_header(headers, name).ok_or_else(|| {
        ProblemResponse::bad_request("missing_header", format!("missing required header {name}"))
    })
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{HeaderValue, Method, Request},
    };
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::ingest::IngestWorker;
    use crate::{router::app_router, telemetry};
    use shop_pulse_storage::{Database, Tenant};
    use shop_pulse_util::SignatureMode;

    const SHOP: &str = "acme.myshopify.com";
    const SECRET: &str = "test-secret";
    const FIXED_NOW: &str = "2024-01-01T00:00:00Z";

    struct TestContext {
        state: AppState,
        database: Database,
        tenant: Tenant,
        receiver: mpsc::Receiver<IngestJob>,
        worker: IngestWorker,
    }

    async fn setup_context(mode: SignatureMode) -> TestContext {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let now = DateTime::parse_from_rfc3339(FIXED_NOW)
            .expect("fixed time")
            .with_timezone(&Utc);
        let tenant = database
            .tenants()
            .connect(SHOP, "shpat_token", now)
            .await
            .expect("tenant");

        let clock = Arc::new(move || now);
        let (state, receiver) = AppState::new(
            metrics,
            database.clone(),
            Some(SECRET.to_string()),
            mode,
            None,
            16,
        );
        let state = state.with_clock(clock.clone());
        let worker = IngestWorker::new(database.clone()).with_clock(clock);

        TestContext {
            state,
            database,
            tenant,
            receiver,
            worker,
        }
    }

    fn sign(body: &str) -> String {
        signature::sign(body.as_bytes(), SECRET)
    }

    fn headers(topic: &str, signature: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_SHOP_DOMAIN, HeaderValue::from_static(SHOP));
        headers.insert(HEADER_TOPIC, HeaderValue::from_str(topic).expect("topic header"));
        if let Some(signature) = signature {
            headers.insert(
                HEADER_SIGNATURE,
                HeaderValue::from_str(signature).expect("signature header"),
            );
        }
        headers
    }

    async fn call_webhook(state: AppState, headers: HeaderMap, body: String) -> Response {
        let mut request_headers = headers;
        request_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks")
            .body(Body::from(body))
            .expect("request");
        *request.headers_mut() = request_headers;

        app_router(state).oneshot(request).await.expect("response")
    }

    async fn body_text(response: Response) -> String {
        let collected = response.into_body().collect().await.expect("body");
        String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8")
    }

    async fn problem_type(response: Response) -> String {
        let body: Value = serde_json::from_str(&body_text(response).await).expect("problem json");
        body["type"].as_str().unwrap_or_default().to_string()
    }

    async fn event_count(database: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(database.pool())
            .await
            .expect("count events")
    }

    fn order_body() -> String {
        json!({
            "id": 555,
            "total_price": "19.99",
            "currency": "USD",
            "created_at": "2024-01-01T00:00:00Z",
            "line_items": [{"product_id": 1, "quantity": 2, "price": "9.995"}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn valid_order_is_acknowledged_then_applied() {
        let mut ctx = setup_context(SignatureMode::Enforced).await;
        let body = order_body();

        let response = call_webhook(
            ctx.state.clone(),
            headers("orders/create", Some(&sign(&body))),
            body.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");

        let job = ctx.receiver.try_recv().expect("job queued");
        assert_eq!(job.topic, "orders/create");
        assert_eq!(job.tenant_id, ctx.tenant.id);

        let stored = ctx
            .database
            .events()
            .fetch(&job.event_id)
            .await
            .expect("fetch")
            .expect("event stored");
        assert_eq!(stored.payload, body, "raw body is stored verbatim");
        assert!(!stored.processed);

        ctx.worker.process(job.clone()).await.expect("process");

        let order = ctx
            .database
            .orders()
            .fetch_by_external_id(&ctx.tenant.id, "555")
            .await
            .expect("fetch")
            .expect("order stored");
        assert_eq!(order.total_cents, Some(1999));
        let items = ctx.database.orders().list_items(&order.id).await.expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(items[0].price_cents, Some(1000));

        let stored = ctx
            .database
            .events()
            .fetch(&job.event_id)
            .await
            .expect("fetch")
            .expect("event stored");
        assert!(stored.processed);
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_without_persisting() {
        let mut ctx = setup_context(SignatureMode::Enforced).await;
        let body = order_body();
        let mut tampered = sign(&body);
        tampered.replace_range(0..1, if tampered.starts_with('A') { "B" } else { "A" });

        let response = call_webhook(
            ctx.state.clone(),
            headers("orders/create", Some(&tampered)),
            body.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(problem_type(response).await, "invalid_signature");

        let response = call_webhook(ctx.state.clone(), headers("orders/create", None), body).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(event_count(&ctx.database).await, 0);
        assert!(ctx.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn signature_covers_exact_raw_bytes() {
        let ctx = setup_context(SignatureMode::Enforced).await;
        let compact = order_body();
        let pretty = serde_json::to_string_pretty(
            &serde_json::from_str::<Value>(&compact).expect("json"),
        )
        .expect("pretty");

        let response = call_webhook(
            ctx.state.clone(),
            headers("orders/create", Some(&sign(&compact))),
            pretty,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(event_count(&ctx.database).await, 0);
    }

    #[tokio::test]
    async fn unknown_shop_returns_not_found() {
        let ctx = setup_context(SignatureMode::Enforced).await;
        let body = order_body();
        let mut request_headers = headers("orders/create", Some(&sign(&body)));
        request_headers.insert(
            HEADER_SHOP_DOMAIN,
            HeaderValue::from_static("stranger.myshopify.com"),
        );

        let response = call_webhook(ctx.state.clone(), request_headers, body).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(problem_type(response).await, "unknown_tenant");
        assert_eq!(event_count(&ctx.database).await, 0);

        let tenants: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants")
            .fetch_one(ctx.database.pool())
            .await
            .expect("count tenants");
        assert_eq!(tenants, 1, "unknown shops are never auto-created");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let ctx = setup_context(SignatureMode::Enforced).await;
        let body = "{\"id\": 555,".to_string();

        let response = call_webhook(
            ctx.state.clone(),
            headers("orders/create", Some(&sign(&body))),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(problem_type(response).await, "invalid_json");
        assert_eq!(event_count(&ctx.database).await, 0);
    }

    #[tokio::test]
    async fn missing_body_or_headers_are_bad_requests() {
        let ctx = setup_context(SignatureMode::Enforced).await;

        let response = call_webhook(
            ctx.state.clone(),
            headers("orders/create", Some(&sign(""))),
            String::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(problem_type(response).await, "missing_body");

        let body = order_body();
        let mut request_headers = headers("orders/create", Some(&sign(&body)));
        request_headers.remove(HEADER_TOPIC);
        let response = call_webhook(ctx.state.clone(), request_headers, body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(problem_type(response).await, "missing_header");

        assert_eq!(event_count(&ctx.database).await, 0);
    }

    #[tokio::test]
    async fn bypass_mode_accepts_unsigned_deliveries() {
        let mut ctx = setup_context(SignatureMode::Bypassed).await;
        let body = json!({"id": 8, "email": "dev@example.com"}).to_string();

        let response = call_webhook(ctx.state.clone(), headers("customers/create", None), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(event_count(&ctx.database).await, 1);
        assert!(ctx.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn redelivered_webhook_id_is_not_dispatched_twice() {
        let mut ctx = setup_context(SignatureMode::Enforced).await;
        let body = order_body();

        for _ in 0..2 {
            let mut request_headers = headers("orders/create", Some(&sign(&body)));
            request_headers.insert(HEADER_WEBHOOK_ID, HeaderValue::from_static("wh-123"));
            let response = call_webhook(ctx.state.clone(), request_headers, body.clone()).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(event_count(&ctx.database).await, 1);
        assert!(ctx.receiver.try_recv().is_ok());
        assert!(ctx.receiver.try_recv().is_err(), "duplicate must not be queued");
    }

    #[tokio::test]
    async fn unsupported_topic_is_stored_and_acknowledged() {
        let mut ctx = setup_context(SignatureMode::Enforced).await;
        let body = json!({"id": 1, "domain": SHOP}).to_string();

        let response = call_webhook(
            ctx.state.clone(),
            headers("app/uninstalled", Some(&sign(&body))),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let job = ctx.receiver.try_recv().expect("job queued");
        ctx.worker.process(job.clone()).await.expect("process");
        let stored = ctx
            .database
            .events()
            .fetch(&job.event_id)
            .await
            .expect("fetch")
            .expect("stored");
        assert_eq!(stored.topic, "app/uninstalled");
        assert!(stored.processed);
    }

    #[tokio::test]
    async fn processing_failure_keeps_raw_event() {
        let mut ctx = setup_context(SignatureMode::Enforced).await;
        let body = "[\"not\", \"an\", \"object\"]".to_string();

        let response = call_webhook(
            ctx.state.clone(),
            headers("orders/create", Some(&sign(&body))),
            body.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK, "vendor never sees processing errors");

        let job = ctx.receiver.try_recv().expect("job queued");
        ctx.worker.process(job.clone()).await.expect_err("array payload fails");

        let stored = ctx
            .database
            .events()
            .fetch(&job.event_id)
            .await
            .expect("fetch")
            .expect("stored");
        assert_eq!(stored.payload, body);
        assert!(!stored.processed);
        assert_eq!(stored.attempts, 1);
    }
}
