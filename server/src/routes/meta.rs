//! Public metadata endpoints: the permission registry and GA4GH
//! service-info.

use axum::Json;
use axum::extract::State;
use platform_authz::{PERMISSIONS, PermissionDef};
use serde::Serialize;
use serde_json::{Value, json};

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct PermissionItem {
    pub id: String,
    pub verb: &'static str,
    pub noun: &'static str,
    pub min_specificity: u8,
    pub supports_data_type_narrowing: bool,
}

impl From<&'static PermissionDef> for PermissionItem {
    fn from(def: &'static PermissionDef) -> Self {
        Self {
            id: def.id(),
            verb: def.verb,
            noun: def.noun,
            min_specificity: def.min_specificity,
            supports_data_type_narrowing: def.supports_data_type_narrowing,
        }
    }
}

pub async fn all_permissions() -> Json<Vec<PermissionItem>> {
    Json(PERMISSIONS.iter().map(PermissionItem::from).collect())
}

pub async fn service_info(State(state): State<AppState>) -> Json<Value> {
    let version = env!("CARGO_PKG_VERSION");
    Json(json!({
        "id": "org.research-platform.authorization",
        "name": "Authorization Service",
        "description": "Centralized authorization decision service for the research platform",
        "type": {
            "group": "org.research-platform",
            "artifact": "authorization",
            "version": version,
        },
        "organization": {
            "name": "Research Platform",
            "url": state.config.service_url,
        },
        "version": version,
        "environment": if state.config.debug { "dev" } else { "prod" },
        "url": state.config.service_url,
    }))
}
