//! Typed CRUD over grants, groups and the pattern catalogues.
//!
//! Every operation runs in a transaction; `policy_snapshot` reads grants and
//! groups inside one transaction so an evaluation sees a stable store state.
//! Stored pattern documents that no longer parse are logged and skipped — a
//! malformed grant behaves as if it did not exist.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use entity::{grants, groups, resources, subjects};
use platform_authz::model::{
    Grant, GrantId, Group, GroupId, ResourcePattern, StoredGrant, StoredGroup, SubjectPattern,
};
use platform_authz::permissions;
use sea_orm::entity::prelude::Json;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::warn;

use crate::{DbError, DbPool, DbResult};

/// One consistent view of the store for a single evaluation.
#[derive(Clone, Debug, Default)]
pub struct PolicySnapshot {
    pub grants: Vec<StoredGrant>,
    pub groups: HashMap<GroupId, StoredGroup>,
}

pub async fn policy_snapshot(db: &DbPool) -> DbResult<PolicySnapshot> {
    let txn = db.begin().await?;
    let grants = load_grants(&txn).await?;
    let groups = groups::Entity::find()
        .all(&txn)
        .await?
        .into_iter()
        .filter_map(group_from_row)
        .map(|group| (group.id, group))
        .collect();
    txn.commit().await?;
    Ok(PolicySnapshot { grants, groups })
}

pub async fn list_grants(db: &DbPool) -> DbResult<Vec<StoredGrant>> {
    let txn = db.begin().await?;
    let grants = load_grants(&txn).await?;
    txn.commit().await?;
    Ok(grants)
}

pub async fn get_grant(db: &DbPool, id: GrantId) -> DbResult<Option<StoredGrant>> {
    let txn = db.begin().await?;
    let Some(row) = grants::Entity::find_by_id(id).one(&txn).await? else {
        return Ok(None);
    };
    let subject_row = subjects::Entity::find_by_id(row.subject_id).one(&txn).await?;
    let resource_row = resources::Entity::find_by_id(row.resource_id).one(&txn).await?;
    txn.commit().await?;

    let (Some(subject_row), Some(resource_row)) = (subject_row, resource_row) else {
        warn!(grant = id, "grant references missing pattern rows; treating as absent");
        return Ok(None);
    };
    let Some(subject) = decode_doc::<SubjectPattern>(&subject_row.doc, "subject", subject_row.id)
    else {
        return Ok(None);
    };
    let Some(resource) =
        decode_doc::<ResourcePattern>(&resource_row.doc, "resource", resource_row.id)
    else {
        return Ok(None);
    };
    Ok(Some(grant_from_parts(row, subject, resource)))
}

pub async fn create_grant(db: &DbPool, grant: &Grant, now: DateTime<Utc>) -> DbResult<StoredGrant> {
    let Some(definition) = permissions::permission(&grant.permission) else {
        return Err(DbError::Validation(format!(
            "unknown permission {}",
            grant.permission
        )));
    };
    if grant.resource.specificity() < definition.min_specificity {
        return Err(DbError::Validation(format!(
            "permission {} cannot be granted at this resource specificity",
            grant.permission
        )));
    }
    if grant.expiry.is_some_and(|expiry| expiry <= now) {
        return Err(DbError::Validation("grant is already expired".into()));
    }

    let txn = db.begin().await?;

    if let SubjectPattern::Group(group_id) = grant.subject {
        if groups::Entity::find_by_id(group_id).one(&txn).await?.is_none() {
            return Err(DbError::Validation(format!(
                "group {group_id} does not exist"
            )));
        }
    }

    let subject_id = resolve_subject_in(&txn, &grant.subject).await?;
    let resource_id = resolve_resource_in(&txn, &grant.resource).await?;

    // Duplicate check ahead of the unique index so the conflict is reported
    // consistently across backends.
    let mut duplicates = grants::Entity::find()
        .filter(grants::Column::SubjectId.eq(subject_id))
        .filter(grants::Column::ResourceId.eq(resource_id))
        .filter(grants::Column::Permission.eq(grant.permission.as_str()));
    duplicates = match grant.expiry {
        Some(expiry) => duplicates.filter(grants::Column::Expiry.eq(expiry)),
        None => duplicates.filter(grants::Column::Expiry.is_null()),
    };
    if duplicates.one(&txn).await?.is_some() {
        return Err(DbError::Conflict(
            "an identical grant already exists".into(),
        ));
    }

    let inserted = grants::ActiveModel {
        subject_id: Set(subject_id),
        resource_id: Set(resource_id),
        permission: Set(grant.permission.clone()),
        negated: Set(grant.negated),
        extra: Set(grant.extra.clone()),
        created: Set(now.into()),
        expiry: Set(grant.expiry.map(Into::into)),
        ..Default::default()
    }
    .insert(&txn)
    .await
    .map_err(|err| conflict_or(err, "an identical grant already exists"))?;
    txn.commit().await?;

    Ok(grant_from_parts(
        inserted,
        grant.subject.clone(),
        grant.resource.clone(),
    ))
}

pub async fn delete_grant(db: &DbPool, id: GrantId) -> DbResult<()> {
    let outcome = grants::Entity::delete_by_id(id).exec(db).await?;
    if outcome.rows_affected == 0 {
        return Err(DbError::NotFound("grant"));
    }
    Ok(())
}

pub async fn list_groups(db: &DbPool) -> DbResult<Vec<StoredGroup>> {
    let rows = groups::Entity::find().all(db).await?;
    Ok(rows.into_iter().filter_map(group_from_row).collect())
}

pub async fn get_group(db: &DbPool, id: GroupId) -> DbResult<Option<StoredGroup>> {
    let row = groups::Entity::find_by_id(id).one(db).await?;
    Ok(row.and_then(group_from_row))
}

pub async fn create_group(db: &DbPool, group: &Group, now: DateTime<Utc>) -> DbResult<StoredGroup> {
    validate_group(group, now)?;
    let inserted = groups::ActiveModel {
        name: Set(group.name.clone()),
        membership: Set(to_doc(&group.membership)?),
        created: Set(now.into()),
        expiry: Set(group.expiry.map(Into::into)),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(|err| conflict_or(err, "a group with this name already exists"))?;

    Ok(StoredGroup {
        id: inserted.id,
        group: group.clone(),
        created: inserted.created.with_timezone(&Utc),
    })
}

pub async fn update_group(db: &DbPool, id: GroupId, group: &Group) -> DbResult<()> {
    validate_group(group, Utc::now())?;
    let txn = db.begin().await?;
    let Some(existing) = groups::Entity::find_by_id(id).one(&txn).await? else {
        return Err(DbError::NotFound("group"));
    };
    let mut model: groups::ActiveModel = existing.into();
    model.name = Set(group.name.clone());
    model.membership = Set(to_doc(&group.membership)?);
    model.expiry = Set(group.expiry.map(Into::into));
    model
        .update(&txn)
        .await
        .map_err(|err| conflict_or(err, "a group with this name already exists"))?;
    txn.commit().await?;
    Ok(())
}

/// Deletion fails while any grant still references the group.
pub async fn delete_group(db: &DbPool, id: GroupId) -> DbResult<()> {
    let txn = db.begin().await?;
    if groups::Entity::find_by_id(id).one(&txn).await?.is_none() {
        return Err(DbError::NotFound("group"));
    }

    let reference_doc = json!({ "group": id });
    if let Some(subject_row) = subjects::Entity::find()
        .filter(subjects::Column::Doc.eq(reference_doc))
        .one(&txn)
        .await?
    {
        let referencing = grants::Entity::find()
            .filter(grants::Column::SubjectId.eq(subject_row.id))
            .count(&txn)
            .await?;
        if referencing > 0 {
            return Err(DbError::Conflict(format!(
                "group {id} is referenced by {referencing} grant(s)"
            )));
        }
    }

    groups::Entity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;
    Ok(())
}

/// Upsert of a subject pattern into the catalogue; returns its id.
pub async fn resolve_subject(db: &DbPool, pattern: &SubjectPattern) -> DbResult<i64> {
    let txn = db.begin().await?;
    let id = resolve_subject_in(&txn, pattern).await?;
    txn.commit().await?;
    Ok(id)
}

/// Upsert of a resource pattern into the catalogue; returns its id.
pub async fn resolve_resource(db: &DbPool, pattern: &ResourcePattern) -> DbResult<i64> {
    let txn = db.begin().await?;
    let id = resolve_resource_in(&txn, pattern).await?;
    txn.commit().await?;
    Ok(id)
}

async fn resolve_subject_in<C: ConnectionTrait>(
    conn: &C,
    pattern: &SubjectPattern,
) -> DbResult<i64> {
    let doc = to_doc(pattern)?;
    if let Some(row) = subjects::Entity::find()
        .filter(subjects::Column::Doc.eq(doc.clone()))
        .one(conn)
        .await?
    {
        return Ok(row.id);
    }
    let inserted = subjects::ActiveModel {
        doc: Set(doc.clone()),
        ..Default::default()
    }
    .insert(conn)
    .await;
    match inserted {
        Ok(row) => Ok(row.id),
        // Lost a race with a concurrent writer; the row exists now.
        Err(err) if is_unique_violation(&err) => {
            let row = subjects::Entity::find()
                .filter(subjects::Column::Doc.eq(doc))
                .one(conn)
                .await?
                .ok_or(DbError::SeaOrm(err))?;
            Ok(row.id)
        }
        Err(err) => Err(err.into()),
    }
}

async fn resolve_resource_in<C: ConnectionTrait>(
    conn: &C,
    pattern: &ResourcePattern,
) -> DbResult<i64> {
    let doc = to_doc(pattern)?;
    if let Some(row) = resources::Entity::find()
        .filter(resources::Column::Doc.eq(doc.clone()))
        .one(conn)
        .await?
    {
        return Ok(row.id);
    }
    let inserted = resources::ActiveModel {
        doc: Set(doc.clone()),
        ..Default::default()
    }
    .insert(conn)
    .await;
    match inserted {
        Ok(row) => Ok(row.id),
        Err(err) if is_unique_violation(&err) => {
            let row = resources::Entity::find()
                .filter(resources::Column::Doc.eq(doc))
                .one(conn)
                .await?
                .ok_or(DbError::SeaOrm(err))?;
            Ok(row.id)
        }
        Err(err) => Err(err.into()),
    }
}

async fn load_grants<C: ConnectionTrait>(conn: &C) -> DbResult<Vec<StoredGrant>> {
    let subject_docs: HashMap<i64, SubjectPattern> = subjects::Entity::find()
        .all(conn)
        .await?
        .into_iter()
        .filter_map(|row| decode_doc(&row.doc, "subject", row.id).map(|doc| (row.id, doc)))
        .collect();
    let resource_docs: HashMap<i64, ResourcePattern> = resources::Entity::find()
        .all(conn)
        .await?
        .into_iter()
        .filter_map(|row| decode_doc(&row.doc, "resource", row.id).map(|doc| (row.id, doc)))
        .collect();

    let rows = grants::Entity::find().all(conn).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let subject = subject_docs.get(&row.subject_id);
            let resource = resource_docs.get(&row.resource_id);
            let (Some(subject), Some(resource)) = (subject, resource) else {
                warn!(grant = row.id, "grant references an unusable pattern row; skipping");
                return None;
            };
            Some(grant_from_parts(row, subject.clone(), resource.clone()))
        })
        .collect())
}

fn grant_from_parts(
    row: grants::Model,
    subject: SubjectPattern,
    resource: ResourcePattern,
) -> StoredGrant {
    StoredGrant {
        id: row.id,
        grant: Grant {
            subject,
            resource,
            permission: row.permission,
            negated: row.negated,
            extra: row.extra,
            expiry: row.expiry.map(|expiry| expiry.with_timezone(&Utc)),
        },
        created: row.created.with_timezone(&Utc),
    }
}

fn group_from_row(row: groups::Model) -> Option<StoredGroup> {
    let membership = decode_doc(&row.membership, "group membership", row.id)?;
    Some(StoredGroup {
        id: row.id,
        group: Group {
            name: row.name,
            membership,
            expiry: row.expiry.map(|expiry| expiry.with_timezone(&Utc)),
        },
        created: row.created.with_timezone(&Utc),
    })
}

fn validate_group(group: &Group, now: DateTime<Utc>) -> DbResult<()> {
    if group.name.trim().is_empty() {
        return Err(DbError::Validation("group name must be non-empty".into()));
    }
    if group.expiry.is_some_and(|expiry| expiry <= now) {
        return Err(DbError::Validation("group is already expired".into()));
    }
    Ok(())
}

fn to_doc<T: Serialize>(value: &T) -> DbResult<Json> {
    serde_json::to_value(value)
        .map_err(|err| DbError::Validation(format!("unserializable pattern: {err}")))
}

fn decode_doc<T: DeserializeOwned>(doc: &Json, what: &str, id: i64) -> Option<T> {
    match serde_json::from_value(doc.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%err, id, "malformed stored {what} document; skipping");
            None
        }
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

fn conflict_or(err: DbErr, message: &str) -> DbError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => DbError::Conflict(message.into()),
        Some(SqlErr::ForeignKeyConstraintViolation(_)) => {
            DbError::Conflict("operation violates referential integrity".into())
        }
        _ => DbError::SeaOrm(err),
    }
}
