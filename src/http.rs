//! The axum surface: one protected route behind bearer-token middleware.
//!
//! Failures become `{"detail": "..."}` bodies. Client-caused failures are 401
//! with a `WWW-Authenticate` challenge; key store and internal failures are 500.
//! The detail is always the generic category; the full error is only logged.

use crate::error::{AuthError, ConfigError};
use crate::gate::AuthGate;
use crate::validator::Claims;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Extension, Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::instrument;

/// The path of the protected endpoint.
pub const PROTECTED_PATH: &str = "/api/endpoint";

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "Authentication failed on the server side");
        } else {
            tracing::debug!(error = %self, "Authentication rejected");
        }

        let body = ErrorResponse {
            detail: self.category().to_string(),
        };
        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer error=\"invalid_token\""),
            );
        }
        response
    }
}

/// Extracts the credentials of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Authentication middleware that validates bearer tokens.
///
/// Verified claims are stored in the request extensions for the handler.
#[instrument(skip_all, name = "oidc_gate.middleware.auth")]
pub async fn require_bearer(
    State(gate): State<AuthGate>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AuthError::MalformedToken("missing Authorization header".to_string()))?;

    let token = bearer_token(header_value).ok_or_else(|| {
        AuthError::MalformedToken("Authorization header is not a bearer token".to_string())
    })?;

    let claims = gate.verify_token(token).await?;
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

async fn protected_endpoint(Extension(claims): Extension<Claims>) -> Json<Value> {
    Json(json!({
        "message": "User authenticated",
        "user": claims,
    }))
}

/// Builds the cross-origin policy: listed origins, any method, any header, credentials allowed.
///
/// Methods and headers are mirrored from the preflight request because browsers
/// reject a literal `*` when credentials are allowed.
pub fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, ConfigError> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| {
                ConfigError::InvalidConfiguration(format!("invalid CORS origin: {}", origin))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

/// Builds the application router with the protected route, CORS and request tracing.
pub fn router(gate: AuthGate, allowed_origins: &[String]) -> Result<Router, ConfigError> {
    let protected = Router::new()
        .route(PROTECTED_PATH, post(protected_endpoint))
        .route_layer(middleware::from_fn_with_state(gate, require_bearer));

    Ok(protected
        .layer(cors_layer(allowed_origins)?)
        .layer(TraceLayer::new_for_http()))
}
