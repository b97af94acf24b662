//! Store tests against an in-memory SQLite database with the schema
//! bootstrapped by hand (the migration crate targets Postgres).

use chrono::{Duration, Utc};
use platform_authz::model::{Grant, Group, GroupMembership, ResourcePattern, SubjectPattern};
use platform_db::{DbError, DbPool, store};
use sea_orm::{ConnectionTrait, Database, DatabaseBackend, Statement};
use serde_json::json;

async fn setup_db() -> DbPool {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    for ddl in [
        r#"
        CREATE TABLE subjects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc TEXT NOT NULL UNIQUE
        );
        "#,
        r#"
        CREATE TABLE resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc TEXT NOT NULL UNIQUE
        );
        "#,
        r#"
        CREATE TABLE "groups" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            membership TEXT NOT NULL,
            created TEXT NOT NULL,
            expiry TEXT
        );
        "#,
        r#"
        CREATE TABLE grants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL REFERENCES subjects (id),
            resource_id INTEGER NOT NULL REFERENCES resources (id),
            permission TEXT NOT NULL,
            negated INTEGER NOT NULL DEFAULT 0,
            extra TEXT NOT NULL,
            created TEXT NOT NULL,
            expiry TEXT,
            UNIQUE (subject_id, resource_id, permission, expiry)
        );
        "#,
    ] {
        db.execute(Statement::from_string(DatabaseBackend::Sqlite, ddl))
            .await
            .unwrap();
    }
    db
}

fn everyone_query_data(resource: serde_json::Value) -> Grant {
    Grant {
        subject: serde_json::from_value(json!({"everyone": true})).unwrap(),
        resource: serde_json::from_value(resource).unwrap(),
        permission: "query:data".into(),
        negated: false,
        extra: json!({}),
        expiry: None,
    }
}

fn expression_group(name: &str) -> Group {
    Group {
        name: name.into(),
        membership: serde_json::from_value(json!({
            "expr": {"claim": "email_verified", "op": "eq", "value": true}
        }))
        .unwrap(),
        expiry: None,
    }
}

#[tokio::test]
async fn grant_round_trip() {
    let db = setup_db().await;
    let now = Utc::now();
    let grant = everyone_query_data(json!({"project": "p1"}));

    let stored = store::create_grant(&db, &grant, now).await.unwrap();
    assert_eq!(stored.grant, grant);

    let fetched = store::get_grant(&db, stored.id).await.unwrap().unwrap();
    assert_eq!(fetched, stored);

    let all = store::list_grants(&db).await.unwrap();
    assert_eq!(all, vec![stored]);

    assert!(store::get_grant(&db, 999).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_grants_conflict_but_expiry_distinguishes() {
    let db = setup_db().await;
    let now = Utc::now();
    let grant = everyone_query_data(json!({"project": "p1"}));

    store::create_grant(&db, &grant, now).await.unwrap();
    let duplicate = store::create_grant(&db, &grant, now).await;
    assert!(matches!(duplicate, Err(DbError::Conflict(_))));

    let mut reissued = grant;
    reissued.expiry = Some(now + Duration::days(30));
    store::create_grant(&db, &reissued, now).await.unwrap();
}

#[tokio::test]
async fn grant_validation_rejects_bad_writes() {
    let db = setup_db().await;
    let now = Utc::now();

    let mut unknown = everyone_query_data(json!({"project": "p1"}));
    unknown.permission = "conjure:data".into();
    assert!(matches!(
        store::create_grant(&db, &unknown, now).await,
        Err(DbError::Validation(_))
    ));

    // delete:project may not be granted wider than a project.
    let mut too_wide = everyone_query_data(json!({"everything": true}));
    too_wide.permission = "delete:project".into();
    assert!(matches!(
        store::create_grant(&db, &too_wide, now).await,
        Err(DbError::Validation(_))
    ));

    let mut expired = everyone_query_data(json!({"project": "p1"}));
    expired.expiry = Some(now - Duration::hours(1));
    assert!(matches!(
        store::create_grant(&db, &expired, now).await,
        Err(DbError::Validation(_))
    ));

    let mut dangling = everyone_query_data(json!({"project": "p1"}));
    dangling.subject = SubjectPattern::Group(41);
    assert!(matches!(
        store::create_grant(&db, &dangling, now).await,
        Err(DbError::Validation(_))
    ));
}

#[tokio::test]
async fn group_crud_and_rename() {
    let db = setup_db().await;
    let now = Utc::now();

    let stored = store::create_group(&db, &expression_group("curators"), now)
        .await
        .unwrap();
    assert_eq!(stored.group.name, "curators");

    let clash = store::create_group(&db, &expression_group("curators"), now).await;
    assert!(matches!(clash, Err(DbError::Conflict(_))));

    let mut renamed = stored.group.clone();
    renamed.name = "data-curators".into();
    renamed.membership = GroupMembership::Members(
        serde_json::from_value(json!({"members": [{"iss": "I", "sub": "U"}]})).unwrap(),
    );
    store::update_group(&db, stored.id, &renamed).await.unwrap();

    let fetched = store::get_group(&db, stored.id).await.unwrap().unwrap();
    assert_eq!(fetched.group, renamed);

    assert!(matches!(
        store::update_group(&db, 999, &renamed).await,
        Err(DbError::NotFound(_))
    ));

    store::delete_group(&db, stored.id).await.unwrap();
    assert!(store::get_group(&db, stored.id).await.unwrap().is_none());
}

#[tokio::test]
async fn group_deletion_blocked_while_referenced() {
    let db = setup_db().await;
    let now = Utc::now();

    let group = store::create_group(&db, &expression_group("portal-users"), now)
        .await
        .unwrap();

    let mut grant = everyone_query_data(json!({"everything": true}));
    grant.subject = SubjectPattern::Group(group.id);
    grant.permission = "view:private_portal".into();
    let stored_grant = store::create_grant(&db, &grant, now).await.unwrap();

    assert!(matches!(
        store::delete_group(&db, group.id).await,
        Err(DbError::Conflict(_))
    ));

    store::delete_grant(&db, stored_grant.id).await.unwrap();
    store::delete_group(&db, group.id).await.unwrap();
}

#[tokio::test]
async fn resolvers_are_idempotent() {
    let db = setup_db().await;

    let subject: SubjectPattern = serde_json::from_value(json!({"iss": "I", "sub": "U"})).unwrap();
    let first = store::resolve_subject(&db, &subject).await.unwrap();
    let second = store::resolve_subject(&db, &subject).await.unwrap();
    assert_eq!(first, second);

    let other: SubjectPattern = serde_json::from_value(json!({"everyone": true})).unwrap();
    assert_ne!(first, store::resolve_subject(&db, &other).await.unwrap());

    let resource: ResourcePattern =
        serde_json::from_value(json!({"project": "p1", "dataset": "d1"})).unwrap();
    let first = store::resolve_resource(&db, &resource).await.unwrap();
    let second = store::resolve_resource(&db, &resource).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn snapshot_contains_grants_and_groups_and_skips_malformed_rows() {
    let db = setup_db().await;
    let now = Utc::now();

    let group = store::create_group(&db, &expression_group("curators"), now)
        .await
        .unwrap();
    let grant = store::create_grant(&db, &everyone_query_data(json!({"project": "p1"})), now)
        .await
        .unwrap();

    // A grant whose subject document no longer parses must vanish from the
    // snapshot instead of failing it.
    db.execute(Statement::from_string(
        DatabaseBackend::Sqlite,
        r#"INSERT INTO subjects (doc) VALUES ('{"galaxy": true}');"#,
    ))
    .await
    .unwrap();
    db.execute(Statement::from_string(
        DatabaseBackend::Sqlite,
        format!(
            r#"INSERT INTO grants (subject_id, resource_id, permission, negated, extra, created)
               SELECT s.id, r.id, 'query:data', 0, '{{}}', '{}'
               FROM subjects s, resources r WHERE s.doc = '{{"galaxy": true}}' LIMIT 1;"#,
            now.to_rfc3339()
        ),
    ))
    .await
    .unwrap();

    let snapshot = store::policy_snapshot(&db).await.unwrap();
    assert_eq!(snapshot.grants, vec![grant]);
    assert_eq!(snapshot.groups.len(), 1);
    assert_eq!(snapshot.groups[&group.id], group);
}
