//! Access control middleware
//!
//! Derives the caller identity from a configured header, classifies the
//! caller as admin or regular, resolves admin impersonation and gates
//! the downstream handler behind an ALL-quantified ownership check on
//! the UUIDs named by the request. A denied check answers 403 without
//! leaking what was checked.

use crate::strategy::query_params;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ceems_api::{AdminUsers, OwnershipOracle};
use ceems_core::DASHBOARD_USER_HEADER;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared state of the access control layer.
pub struct AuthState {
    /// Resolves per-unit ownership
    pub oracle: Arc<dyn OwnershipOracle>,
    /// Resolves admin membership
    pub admins: Arc<AdminUsers>,
    /// Name of the header carrying the caller identity
    pub identity_header: String,
}

/// 400-class responses carry a short machine-readable error payload.
pub fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({
            "status": "error",
            "errorType": error_type,
            "error": message,
        })),
    )
        .into_response()
}

/// The middleware entry point.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(user) = request
        .headers()
        .get(&auth.identity_header)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            &format!("missing identity header {}", auth.identity_header),
        );
    };

    // A dashboard user is honored only when the logged-in user is an
    // admin; the ownership check below then runs against the
    // impersonated identity
    let dashboard_user = request
        .headers()
        .get(DASHBOARD_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let effective_user = match dashboard_user {
        Some(dashboard) if auth.admins.is_admin(&user) => {
            debug!(admin = %user, dashboard_user = %dashboard, "Admin impersonation");
            dashboard
        }
        _ => user,
    };

    if auth.admins.is_admin(&effective_user) {
        return next.run(request).await;
    }

    let uuids = query_params(request.uri().query(), "uuid");
    if uuids.is_empty() {
        return next.run(request).await;
    }

    match auth.oracle.verify(&effective_user, &uuids).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            debug!(user = %effective_user, "Ownership check denied request");
            // Bare 403: no detail of what was checked
            StatusCode::FORBIDDEN.into_response()
        }
        Err(e) => {
            warn!(error = %e, "Ownership oracle unavailable");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "ownership verification unavailable",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use ceems_api::MockOracle;
    use ceems_core::LOGGED_USER_HEADER;
    use tower::ServiceExt;

    fn app(admins: AdminUsers) -> Router {
        let oracle = MockOracle::new()
            .with_unit("X", "usr1", "acc1")
            .with_unit("Y", "usr9", "acc9");

        let auth = Arc::new(AuthState {
            oracle: Arc::new(oracle),
            admins: Arc::new(admins),
            identity_header: LOGGED_USER_HEADER.to_string(),
        });

        Router::new()
            .route("/api/v1/units", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(auth, auth_middleware))
    }

    async fn request(app: Router, uri: &str, headers: &[(&str, &str)]) -> StatusCode {
        let mut builder = axum::http::Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        app.oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_missing_identity_header() {
        let status = request(app(AdminUsers::new([])), "/api/v1/units", &[]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_owner_passes() {
        let status = request(
            app(AdminUsers::new([])),
            "/api/v1/units?uuid=X",
            &[(LOGGED_USER_HEADER, "usr1")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_partial_ownership_fails_whole_request() {
        // usr1 owns X but has no relation to Y: ALL-quantified check
        // fails and answers a bare 403
        let status = request(
            app(AdminUsers::new([])),
            "/api/v1/units?uuid=X&uuid=Y",
            &[(LOGGED_USER_HEADER, "usr1")],
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_bypasses_ownership() {
        let status = request(
            app(AdminUsers::new(["adm1".to_string()])),
            "/api/v1/units?uuid=X&uuid=Y",
            &[(LOGGED_USER_HEADER, "adm1")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_impersonation_checks_target_user() {
        // Impersonated usr1 does not own Y, so even an admin caller is
        // denied for this request
        let status = request(
            app(AdminUsers::new(["adm1".to_string()])),
            "/api/v1/units?uuid=Y",
            &[(LOGGED_USER_HEADER, "adm1"), (DASHBOARD_USER_HEADER, "usr1")],
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_non_admin_cannot_impersonate() {
        // The dashboard header from a regular user is ignored; the check
        // runs against the caller, who owns X
        let status = request(
            app(AdminUsers::new([])),
            "/api/v1/units?uuid=X",
            &[(LOGGED_USER_HEADER, "usr1"), (DASHBOARD_USER_HEADER, "usr9")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_uuids_passes_through() {
        let status = request(
            app(AdminUsers::new([])),
            "/api/v1/units",
            &[(LOGGED_USER_HEADER, "usr1")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
