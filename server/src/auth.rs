//! Request authentication and the self-evaluated admin permission checks.

use axum::http::{HeaderMap, header};
use chrono::Utc;
use platform_authz::model::{ResolvedSubject, ResourcePattern};
use platform_authz::{DecisionRecord, PermissionDef};

use crate::error::{ApiError, from_authn};
use crate::http::AppState;

/// Resolve the caller: no Authorization header means anonymous; a present
/// but invalid bearer is a 401, never a silent fallback to anonymous.
pub async fn current_subject(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<ResolvedSubject, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(ResolvedSubject::anonymous());
    };
    let raw = value
        .to_str()
        .map_err(|_| ApiError::Unauthorized("authorization header is not valid UTF-8".into()))?;
    let Some(token) = raw.strip_prefix("Bearer ") else {
        return Err(ApiError::Unauthorized(
            "authorization header must carry a bearer token".into(),
        ));
    };
    let claims = state
        .verifier
        .verify(token.trim())
        .await
        .map_err(from_authn)?;
    Ok(ResolvedSubject::from_claims(claims.claims))
}

/// Admin-endpoint gate: evaluate `permission` on `resource` for the caller
/// against a fresh snapshot. Denials are logged as deny decisions.
pub async fn require_permission(
    state: &AppState,
    subject: &ResolvedSubject,
    resource: &ResourcePattern,
    permission: &'static PermissionDef,
) -> Result<(), ApiError> {
    let snapshot = state.snapshot().await?;
    let now = Utc::now();
    let outcome = state.evaluator(&snapshot, now).evaluate(
        subject,
        std::slice::from_ref(resource),
        &[permission],
    );
    if outcome.decision() {
        return Ok(());
    }

    let requested = vec![permission.id()];
    DecisionRecord::new(
        now,
        subject,
        std::slice::from_ref(resource),
        &requested,
        false,
        &outcome.matched_grant_ids,
    )
    .emit();
    Err(ApiError::forbidden(format!(
        "caller does not hold {} on the requested resource",
        permission.id()
    )))
}
