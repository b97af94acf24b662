use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use platform_authn::TokenVerifier;
use platform_authz::Evaluator;
use platform_db::{DbError, DbPool, PolicySnapshot, store, with_transient_retry};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{ApiError, from_db};
use crate::routes;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    addr: SocketAddr,
}

impl ServeConfig {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::from((host, port)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<AppConfig>,
    pub verifier: Arc<TokenVerifier>,
}

impl AppState {
    /// One consistent store snapshot, with bounded retries on transient
    /// connection failures.
    pub async fn snapshot(&self) -> Result<PolicySnapshot, ApiError> {
        with_transient_retry(|| store::policy_snapshot(&self.db))
            .await
            .map_err(|err| self.db_error(err))
    }

    pub fn evaluator<'a>(
        &'a self,
        snapshot: &'a PolicySnapshot,
        now: DateTime<Utc>,
    ) -> Evaluator<'a> {
        Evaluator::new(
            &snapshot.grants,
            &snapshot.groups,
            &self.config.superusers,
            now,
        )
    }

    pub fn db_error(&self, err: DbError) -> ApiError {
        from_db(err, self.config.debug)
    }
}

pub async fn serve(config: ServeConfig, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    info!(%config.addr, "authorization service listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");
    let layers = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(cors_layer(&state.config));

    Router::new()
        .route("/policy/evaluate", post(routes::policy::evaluate))
        .route("/policy/evaluate_one", post(routes::policy::evaluate_one))
        .route("/policy/permissions", post(routes::policy::list_permissions))
        .route(
            "/grants",
            get(routes::grants::list).post(routes::grants::create),
        )
        .route(
            "/grants/{grant_id}",
            get(routes::grants::fetch).delete(routes::grants::remove),
        )
        .route(
            "/groups",
            get(routes::groups::list).post(routes::groups::create),
        )
        .route(
            "/groups/{group_id}",
            get(routes::groups::fetch)
                .put(routes::groups::update)
                .delete(routes::groups::remove),
        )
        .route("/all_permissions", get(routes::meta::all_permissions))
        .route("/service-info", get(routes::meta::service_info))
        .layer(layers)
        .with_state(state)
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        signal(SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    ctrl_c.await;

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    };
}
