//! Policy evaluation endpoints.
//!
//! These are public: the answer is specific to the presented token (or to
//! the anonymous caller), so holding a permission is not a prerequisite for
//! asking. A rate limiter belongs in front of this service.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use platform_authz::model::ResourcePattern;
use platform_authz::{DecisionRecord, PermissionDef, permission};
use serde::{Deserialize, Serialize};

use crate::auth::current_subject;
use crate::error::{ApiError, AppJson};
use crate::http::AppState;

#[derive(Debug, Deserialize)]
pub struct EvaluateMatrixRequest {
    pub resources: Vec<ResourcePattern>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EvaluateMatrixResponse {
    pub result: Vec<Vec<bool>>,
}

pub async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(body): AppJson<EvaluateMatrixRequest>,
) -> Result<Json<EvaluateMatrixResponse>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    let permissions = resolve_permissions(&body.permissions)?;
    let snapshot = state.snapshot().await?;
    let now = Utc::now();
    let outcome = state
        .evaluator(&snapshot, now)
        .evaluate(&subject, &body.resources, &permissions);
    DecisionRecord::new(
        now,
        &subject,
        &body.resources,
        &body.permissions,
        outcome.decision(),
        &outcome.matched_grant_ids,
    )
    .emit();
    Ok(Json(EvaluateMatrixResponse {
        result: outcome.result,
    }))
}

/// Scalar variant, kept separate so callers cannot accidentally treat a
/// non-empty `[[false]]` matrix as truthy.
#[derive(Debug, Deserialize)]
pub struct EvaluateScalarRequest {
    pub resource: ResourcePattern,
    pub permission: String,
}

#[derive(Debug, Serialize)]
pub struct EvaluateScalarResponse {
    pub result: bool,
}

pub async fn evaluate_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(body): AppJson<EvaluateScalarRequest>,
) -> Result<Json<EvaluateScalarResponse>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    let requested_permissions = vec![body.permission.clone()];
    let permissions = resolve_permissions(&requested_permissions)?;
    let resources = vec![body.resource];
    let snapshot = state.snapshot().await?;
    let now = Utc::now();
    let outcome = state
        .evaluator(&snapshot, now)
        .evaluate(&subject, &resources, &permissions);
    let result = outcome.decision();
    DecisionRecord::new(
        now,
        &subject,
        &resources,
        &requested_permissions,
        result,
        &outcome.matched_grant_ids,
    )
    .emit();
    Ok(Json(EvaluateScalarResponse { result }))
}

#[derive(Debug, Deserialize)]
pub struct ListPermissionsRequest {
    pub resources: Vec<ResourcePattern>,
}

#[derive(Debug, Serialize)]
pub struct ListPermissionsResponse {
    pub result: Vec<Vec<String>>,
}

pub async fn list_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(body): AppJson<ListPermissionsRequest>,
) -> Result<Json<ListPermissionsResponse>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    let snapshot = state.snapshot().await?;
    let now = Utc::now();
    let result = state
        .evaluator(&snapshot, now)
        .permissions_for(&subject, &body.resources);
    DecisionRecord::new(now, &subject, &body.resources, &[], true, &[]).emit();
    Ok(Json(ListPermissionsResponse { result }))
}

fn resolve_permissions(ids: &[String]) -> Result<Vec<&'static PermissionDef>, ApiError> {
    ids.iter()
        .map(|id| {
            permission(id).ok_or_else(|| ApiError::bad_request(format!("unknown permission {id}")))
        })
        .collect()
}
