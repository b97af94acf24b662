//! Grant CRUD. Grants are immutable apart from deletion; reads are filtered
//! by `view:permissions` on each grant's resource, writes require
//! `edit:permissions` there.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use platform_authz::model::{Grant, GrantId, StoredGrant};
use platform_authz::permissions::{P_EDIT_PERMISSIONS, P_VIEW_PERMISSIONS};
use platform_db::store;

use crate::auth::{current_subject, require_permission};
use crate::error::{ApiError, AppJson};
use crate::http::AppState;

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<StoredGrant>>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    let snapshot = state.snapshot().await?;
    let evaluator = state.evaluator(&snapshot, Utc::now());
    let visible = snapshot
        .grants
        .iter()
        .filter(|stored| {
            evaluator
                .evaluate(
                    &subject,
                    std::slice::from_ref(&stored.grant.resource),
                    &[&P_VIEW_PERMISSIONS],
                )
                .decision()
        })
        .cloned()
        .collect::<Vec<_>>();
    Ok(Json(visible))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(grant): AppJson<Grant>,
) -> Result<(StatusCode, Json<StoredGrant>), ApiError> {
    let subject = current_subject(&state, &headers).await?;
    require_permission(&state, &subject, &grant.resource, &P_EDIT_PERMISSIONS).await?;
    let stored = store::create_grant(&state.db, &grant, Utc::now())
        .await
        .map_err(|err| state.db_error(err))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(grant_id): Path<GrantId>,
    headers: HeaderMap,
) -> Result<Json<StoredGrant>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    let stored = load_grant(&state, grant_id).await?;
    require_permission(&state, &subject, &stored.grant.resource, &P_VIEW_PERMISSIONS).await?;
    Ok(Json(stored))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(grant_id): Path<GrantId>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    let stored = load_grant(&state, grant_id).await?;
    require_permission(&state, &subject, &stored.grant.resource, &P_EDIT_PERMISSIONS).await?;
    store::delete_grant(&state.db, grant_id)
        .await
        .map_err(|err| state.db_error(err))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_grant(state: &AppState, grant_id: GrantId) -> Result<StoredGrant, ApiError> {
    store::get_grant(&state.db, grant_id)
        .await
        .map_err(|err| state.db_error(err))?
        .ok_or_else(|| ApiError::not_found(format!("grant {grant_id} not found")))
}
