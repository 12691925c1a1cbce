use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use shop_pulse_storage::TenantError;

use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
struct ConnectTenantRequest {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TenantResponse {
    pub id: String,
    pub store_name: String,
    pub domain: String,
}

/// `POST /admin/tenants`: registers a shop, or rotates the access token of
/// an already connected one.
pub async fn connect_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TenantResponse>, ProblemResponse> {
    let Some(expected) = state.admin_token() else {
        return Err(ProblemResponse::not_found(
            "admin_disabled",
            "tenant administration is not enabled",
        ));
    };
    authorize(&headers, expected)?;

    let request: ConnectTenantRequest = serde_json::from_slice(&body).map_err(|err| {
        ProblemResponse::bad_request("invalid_json", format!("failed to parse request: {err}"))
    })?;
    let domain = required_field(request.domain, "domain")?;
    let access_token = required_field(request.access_token, "access_token")?;

    let tenant = state
        .storage()
        .tenants()
        .connect(&domain, &access_token, state.now())
        .await
        .map_err(|err| match err {
            TenantError::InvalidDomain => {
                ProblemResponse::bad_request("invalid_domain", err.to_string())
            }
            TenantError::Database(db_err) => {
                error!(stage = "admin", %domain, error = %db_err, "failed to connect tenant");
                ProblemResponse::storage_error("failed to store tenant")
            }
        })?;

    info!(
        stage = "admin",
        tenant_id = %tenant.id,
        domain = %tenant.domain,
        "tenant connected"
    );
    Ok(Json(TenantResponse {
        id: tenant.id,
        store_name: tenant.store_name,
        domain: tenant.domain,
    }))
}

fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), ProblemResponse> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) && !provided.is_empty() {
        return Ok(());
    }
    warn!(stage = "admin", "rejected admin request with invalid token");
    Err(ProblemResponse::new(
        StatusCode::UNAUTHORIZED,
        "invalid_token",
        "a valid bearer token is required",
    ))
}

fn required_field(value: Option<String>, name: &str) -> Result<String, ProblemResponse> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProblemResponse::bad_request("missing_field", format!("{name} is required")))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{HeaderValue, Method, Request},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use shop_pulse_storage::Database;
    use shop_pulse_util::SignatureMode;
    use tower::ServiceExt;

    use super::*;
    use crate::{router::app_router, telemetry};

    const ADMIN_TOKEN: &str = "admin-secret";

    async fn setup_state(admin_token: Option<&str>) -> (AppState, Database) {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let database = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");
        let (state, _receiver) = AppState::new(
            metrics,
            database.clone(),
            Some("secret".to_string()),
            SignatureMode::Enforced,
            admin_token.map(str::to_string),
            4,
        );
        (state, database)
    }

    async fn post(state: AppState, token: Option<&str>, body: Value) -> Response {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/admin/tenants")
            .body(Body::from(body.to_string()))
            .expect("request");
        if let Some(token) = token {
            request.headers_mut().insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
            );
        }
        app_router(state).oneshot(request).await.expect("response")
    }

    async fn json_body(response: Response) -> Value {
        let collected = response.into_body().collect().await.expect("body");
        serde_json::from_slice(&collected.to_bytes()).expect("json")
    }

    #[tokio::test]
    async fn connects_and_reconnects_tenant() {
        let (state, database) = setup_state(Some(ADMIN_TOKEN)).await;
        let request = json!({"domain": "Acme.myshopify.com", "access_token": "first"});

        let response = post(state.clone(), Some(ADMIN_TOKEN), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let created = json_body(response).await;
        assert_eq!(created["domain"], "acme.myshopify.com");
        assert_eq!(created["store_name"], "acme");

        let request = json!({"domain": "acme.myshopify.com", "access_token": "second"});
        let response = post(state, Some(ADMIN_TOKEN), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let updated = json_body(response).await;
        assert_eq!(updated["id"], created["id"]);

        let tenant = database
            .tenants()
            .find_by_domain("acme.myshopify.com")
            .await
            .expect("lookup")
            .expect("tenant");
        assert_eq!(tenant.access_token, "second");
    }

    #[tokio::test]
    async fn rejects_wrong_or_missing_token() {
        let (state, _) = setup_state(Some(ADMIN_TOKEN)).await;
        let request = json!({"domain": "acme.myshopify.com", "access_token": "x"});

        let response = post(state.clone(), Some("nope"), request.clone()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = post(state, None, request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn disabled_without_configured_token() {
        let (state, _) = setup_state(None).await;
        let request = json!({"domain": "acme.myshopify.com", "access_token": "x"});

        let response = post(state, Some(ADMIN_TOKEN), request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_fields_are_bad_requests() {
        let (state, _) = setup_state(Some(ADMIN_TOKEN)).await;

        let response = post(state.clone(), Some(ADMIN_TOKEN), json!({"domain": "acme.myshopify.com"})).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let problem = json_body(response).await;
        assert_eq!(problem["type"], "missing_field");

        let response = post(state, Some(ADMIN_TOKEN), json!({"domain": " ", "access_token": "x"})).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
