//! Middleware: federation request authentication.

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use hearth_common::error::HearthError;
use serde_json::Value;
use tracing::warn;

use crate::{AppState, MAX_BODY_BYTES};

/// The remote server whose `HearthFederation` signature checked out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationOrigin(pub String);

/// Verify the `Authorization: HearthFederation ...` header over the method,
/// request target and JSON body, then hand the verified origin to handlers
/// as an `Extension<FederationOrigin>`.
pub async fn federation_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, HearthError> {
    let (mut parts, body) = request.into_parts();

    let authorization = parts
        .headers
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().map_err(|_| HearthError::BadSignature { message: "non-ASCII Authorization".into() }))
        .transpose()?;

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| HearthError::Validation { message: format!("unreadable body: {e}") })?;
    let content: Option<Value> = if bytes.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&bytes)
                .map_err(|e| HearthError::Validation { message: format!("body is not JSON: {e}") })?,
        )
    };

    let target = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let origin = state
        .ingress
        .authenticate(authorization, parts.method.as_str(), target, content.as_ref())
        .await
        .map_err(|e| {
            warn!(method = %parts.method, uri = %target, error = %e, "Rejected federation request");
            HearthError::from(e)
        })?;

    parts.extensions.insert(FederationOrigin(origin));
    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
