//! Group CRUD. Groups are platform-wide, so reads and writes are gated on
//! `view:groups` / `edit:groups` at the everything scope. Unlike grants,
//! groups may be renamed and have their membership or expiry edited.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use platform_authz::model::{Group, GroupId, ResourcePattern, StoredGroup};
use platform_authz::permissions::{P_EDIT_GROUPS, P_VIEW_GROUPS};
use platform_db::store;

use crate::auth::{current_subject, require_permission};
use crate::error::{ApiError, AppJson};
use crate::http::AppState;

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<StoredGroup>>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    require_permission(&state, &subject, &ResourcePattern::Everything, &P_VIEW_GROUPS).await?;
    let groups = store::list_groups(&state.db)
        .await
        .map_err(|err| state.db_error(err))?;
    Ok(Json(groups))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(group): AppJson<Group>,
) -> Result<(StatusCode, Json<StoredGroup>), ApiError> {
    let subject = current_subject(&state, &headers).await?;
    require_permission(&state, &subject, &ResourcePattern::Everything, &P_EDIT_GROUPS).await?;
    let stored = store::create_group(&state.db, &group, Utc::now())
        .await
        .map_err(|err| state.db_error(err))?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    headers: HeaderMap,
) -> Result<Json<StoredGroup>, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    require_permission(&state, &subject, &ResourcePattern::Everything, &P_VIEW_GROUPS).await?;
    store::get_group(&state.db, group_id)
        .await
        .map_err(|err| state.db_error(err))?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("group {group_id} not found")))
}

pub async fn update(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    headers: HeaderMap,
    AppJson(group): AppJson<Group>,
) -> Result<StatusCode, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    require_permission(&state, &subject, &ResourcePattern::Everything, &P_EDIT_GROUPS).await?;
    store::update_group(&state.db, group_id, &group)
        .await
        .map_err(|err| state.db_error(err))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let subject = current_subject(&state, &headers).await?;
    require_permission(&state, &subject, &ResourcePattern::Everything, &P_EDIT_GROUPS).await?;
    store::delete_group(&state.db, group_id)
        .await
        .map_err(|err| state.db_error(err))?;
    Ok(StatusCode::NO_CONTENT)
}
