//! Authentication module

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use zapcast_common::types::TenantId;
use zapcast_core::{
    CampaignManager, DispatchInvoker, DispatchMetrics, SchedulerTrigger, StallDetector,
};
use zapcast_storage::DatabasePool;

use crate::error::ApiError;

/// Header carrying the tenant a campaign request acts for
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CampaignManager>,
    pub invoker: Arc<dyn DispatchInvoker>,
    pub trigger: Arc<SchedulerTrigger>,
    pub stall: Arc<StallDetector>,
    pub metrics: Arc<DispatchMetrics>,
    /// Bearer token required on every non-health route; `None` disables auth
    pub trigger_token: Option<String>,
    /// Checked by the readiness probe when present
    pub db_pool: Option<DatabasePool>,
}

/// Extract the bearer token from the Authorization header
pub fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Compare two tokens without short-circuiting on the first differing byte.
///
/// Both sides are hashed first so the comparison always covers 32 bytes,
/// whatever the token lengths.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.trigger_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    match extract_bearer_token(&request) {
        Some(token) if tokens_match(token, expected) => Ok(next.run(request).await),
        Some(_) => {
            warn!("Invalid bearer token in request to {}", request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing bearer token in request to {}", request.uri().path());
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Tenant taken from the `X-Tenant-Id` header
#[derive(Debug, Clone, Copy)]
pub struct Tenant(pub TenantId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest("Missing X-Tenant-Id header".to_string()))?;

        Uuid::parse_str(raw)
            .map(Tenant)
            .map_err(|_| ApiError::BadRequest(format!("Invalid X-Tenant-Id header: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("s3cret-token", "s3cret-token"));
        assert!(!tokens_match("s3cret-tokem", "s3cret-token"));
        assert!(!tokens_match("s3cret", "s3cret-token"));
        assert!(!tokens_match("", "s3cret-token"));
    }
}
