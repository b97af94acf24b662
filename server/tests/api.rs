//! Full-router tests over an in-memory SQLite store. Token verification is
//! disabled (dev mode) so bearer tokens are plain HS256-signed claim sets.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use platform_authn::{TokenVerifier, VerifierConfig};
use platform_authz::SuperuserPrincipal;
use sea_orm::{ConnectionTrait, Database, DatabaseBackend, Statement};
use serde_json::{Value, json};
use server::config::AppConfig;
use server::http::{AppState, build_router};
use tower::ServiceExt;

const ISS: &str = "https://idp.example.org/realms/research";
const SUPERUSER_SUB: &str = "platform-ops";

async fn test_state() -> AppState {
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

    let mut verifier_config = VerifierConfig::new(
        "https://idp.example.org/realms/research/.well-known/openid-configuration",
        vec!["account".into()],
    );
    verifier_config.disable_verification = true;

    let config = AppConfig {
        debug: false,
        service_url: "http://127.0.0.1:5000".into(),
        cors_origins: vec![],
        superusers: vec![SuperuserPrincipal {
            iss: ISS.into(),
            sub: SUPERUSER_SUB.into(),
        }],
        verifier: verifier_config.clone(),
        request_timeout: Duration::from_secs(10),
    };

    AppState {
        db,
        config: Arc::new(config),
        verifier: Arc::new(TokenVerifier::new(verifier_config).unwrap()),
    }
}

async fn app() -> Router {
    build_router(test_state().await)
}

fn bearer_with(claims: Value) -> String {
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap();
    format!("Bearer {token}")
}

fn bearer(sub: &str) -> String {
    bearer_with(json!({"iss": ISS, "sub": sub, "azp": "research-web", "aud": "account"}))
}

async fn send(
    router: &Router,
    method: Method,
    path: &str,
    auth: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    let request = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn service_info_and_permission_registry_are_public() {
    let app = app().await;

    let (status, info) = send(&app, Method::GET, "/service-info", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["type"]["artifact"], "authorization");
    assert_eq!(info["environment"], "prod");

    let (status, registry) = send(&app, Method::GET, "/all_permissions", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = registry.as_array().unwrap();
    assert_eq!(entries.len(), platform_authz::PERMISSIONS.len());
    assert!(entries.iter().any(|entry| entry["id"] == "query:data"));
}

#[tokio::test]
async fn anonymous_evaluation_denies_on_empty_store() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        None,
        Some(json!({"resources": [{"everything": true}], "permissions": ["query:data"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!([[false]]));
}

#[tokio::test]
async fn evaluation_matrix_has_resources_by_permissions_shape() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        None,
        Some(json!({
            "resources": [{"project": "p1"}, {"project": "p2"}, {"project": "p3"}],
            "permissions": ["query:data", "download:data"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["result"],
        json!([[false, false], [false, false], [false, false]])
    );
}

#[tokio::test]
async fn unknown_permission_is_a_bad_request() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        None,
        Some(json!({"resources": [{"everything": true}], "permissions": ["conjure:data"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn malformed_bearer_is_unauthorized_not_anonymous() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        Some("Bearer not-a-jwt"),
        Some(json!({"resources": [{"everything": true}], "permissions": ["query:data"]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        Some("Basic dXNlcjpwdw=="),
        Some(json!({"resources": [{"everything": true}], "permissions": ["query:data"]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_body_is_unprocessable() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        None,
        Some(json!({"resources": [{"galaxy": true}], "permissions": ["query:data"]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "unprocessable_entity");
}

#[tokio::test]
async fn cascade_with_negation_end_to_end() {
    let app = app().await;
    let ops = bearer(SUPERUSER_SUB);

    let (status, _) = send(
        &app,
        Method::POST,
        "/grants",
        Some(&ops),
        Some(json!({
            "subject": {"everyone": true},
            "resource": {"project": "p1"},
            "permission": "query:data",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        Method::POST,
        "/grants",
        Some(&ops),
        Some(json!({
            "subject": {"everyone": true},
            "resource": {"project": "p1", "dataset": "d1"},
            "permission": "query:data",
            "negated": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate",
        None,
        Some(json!({
            "resources": [
                {"project": "p1", "dataset": "d1"},
                {"project": "p1", "dataset": "d2"},
            ],
            "permissions": ["query:data"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!([[false], [true]]));

    // evaluate_one agrees with the 1x1 matrix.
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate_one",
        None,
        Some(json!({"resource": {"project": "p1", "dataset": "d1"}, "permission": "query:data"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(false));

    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/permissions",
        None,
        Some(json!({"resources": [{"project": "p1", "dataset": "d2"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!([["query:data"]]));
}

#[tokio::test]
async fn superuser_holds_everything_without_grants() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate_one",
        Some(&bearer(SUPERUSER_SUB)),
        Some(json!({"resource": {"project": "p1"}, "permission": "delete:project"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(true));
}

#[tokio::test]
async fn non_superuser_writes_are_forbidden() {
    let app = app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/grants",
        Some(&bearer("ordinary-user")),
        Some(json!({
            "subject": {"everyone": true},
            "resource": {"project": "p1"},
            "permission": "query:data",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");
}

#[tokio::test]
async fn grant_crud_and_per_resource_visibility() {
    let app = app().await;
    let ops = bearer(SUPERUSER_SUB);

    let (status, created) = send(
        &app,
        Method::POST,
        "/grants",
        Some(&ops),
        Some(json!({
            "subject": {"iss": ISS, "sub": "alice"},
            "resource": {"project": "p1"},
            "permission": "query:data",
            "extra": {"note": "pilot access"},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let grant_id = created["id"].as_i64().unwrap();
    assert_eq!(created["permission"], "query:data");
    assert_eq!(created["extra"]["note"], "pilot access");

    // A duplicate write conflicts.
    let (status, body) = send(
        &app,
        Method::POST,
        "/grants",
        Some(&ops),
        Some(json!({
            "subject": {"iss": ISS, "sub": "alice"},
            "resource": {"project": "p1"},
            "permission": "query:data",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    // Anonymous callers hold view:permissions nowhere, so the list is empty
    // for them and the direct read is forbidden.
    let (status, listed) = send(&app, Method::GET, "/grants", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed, json!([]));

    let path = format!("/grants/{grant_id}");
    let (status, _) = send(&app, Method::GET, &path, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, fetched) = send(&app, Method::GET, &path, Some(&ops), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], json!(grant_id));

    let (status, listed) = send(&app, Method::GET, "/grants", Some(&ops), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, &path, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, Method::DELETE, &path, Some(&ops), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, Method::GET, &path, Some(&ops), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn group_crud_and_referential_integrity() {
    let app = app().await;
    let ops = bearer(SUPERUSER_SUB);

    let (status, _) = send(&app, Method::GET, "/groups", None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, group) = send(
        &app,
        Method::POST,
        "/groups",
        Some(&ops),
        Some(json!({
            "name": "verified-users",
            "membership": {"expr": {"claim": "email_verified", "op": "eq", "value": true}},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let group_id = group["id"].as_i64().unwrap();

    let (status, listed) = send(&app, Method::GET, "/groups", Some(&ops), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        Method::POST,
        "/grants",
        Some(&ops),
        Some(json!({
            "subject": {"group": group_id},
            "resource": {"everything": true},
            "permission": "view:private_portal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Deleting a referenced group violates referential integrity.
    let group_path = format!("/groups/{group_id}");
    let (status, body) = send(&app, Method::DELETE, &group_path, Some(&ops), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    // The expression group drives portal access (scenario: verified email).
    let verified = bearer_with(json!({
        "iss": ISS, "sub": "carol", "azp": "research-web", "email_verified": true,
    }));
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate_one",
        Some(&verified),
        Some(json!({"resource": {"project": "portal"}, "permission": "view:private_portal"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(true));

    let unverified = bearer_with(json!({
        "iss": ISS, "sub": "mallory", "azp": "research-web", "email_verified": false,
    }));
    let (status, body) = send(
        &app,
        Method::POST,
        "/policy/evaluate_one",
        Some(&unverified),
        Some(json!({"resource": {"project": "portal"}, "permission": "view:private_portal"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(false));

    // Rename the group, then clean up grant-first and delete it.
    let (status, _) = send(
        &app,
        Method::PUT,
        &group_path,
        Some(&ops),
        Some(json!({
            "name": "verified-researchers",
            "membership": {"expr": {"claim": "email_verified", "op": "eq", "value": true}},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, grants_list) = send(&app, Method::GET, "/grants", Some(&ops), None).await;
    let grant_id = grants_list.as_array().unwrap()[0]["id"].as_i64().unwrap();
    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/grants/{grant_id}"),
        Some(&ops),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::DELETE, &group_path, Some(&ops), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, Method::PUT, &group_path, Some(&ops), Some(json!({
        "name": "gone",
        "membership": {"members": []},
    })))
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
