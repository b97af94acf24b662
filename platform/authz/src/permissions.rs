//! The fixed permission registry.
//!
//! Permission ids are `verb:noun` strings. Each entry carries the
//! least-specific resource level at which it may be granted
//! (`min_specificity`, on the [`crate::model::ResourcePattern::specificity`]
//! scale) and whether it may be narrowed to a single data type.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PermissionDef {
    pub verb: &'static str,
    pub noun: &'static str,
    pub min_specificity: u8,
    pub supports_data_type_narrowing: bool,
}

impl PermissionDef {
    pub fn id(&self) -> String {
        format!("{}:{}", self.verb, self.noun)
    }
}

const fn perm(
    verb: &'static str,
    noun: &'static str,
    min_specificity: u8,
    supports_data_type_narrowing: bool,
) -> PermissionDef {
    PermissionDef {
        verb,
        noun,
        min_specificity,
        supports_data_type_narrowing,
    }
}

pub const P_QUERY_PROJECT_LEVEL_BOOLEAN: PermissionDef =
    perm("query", "project_level_boolean", 0, false);
pub const P_QUERY_DATASET_LEVEL_BOOLEAN: PermissionDef =
    perm("query", "dataset_level_boolean", 0, false);
pub const P_QUERY_PROJECT_LEVEL_COUNTS: PermissionDef =
    perm("query", "project_level_counts", 0, false);
pub const P_QUERY_DATASET_LEVEL_COUNTS: PermissionDef =
    perm("query", "dataset_level_counts", 0, false);

pub const P_QUERY_DATA: PermissionDef = perm("query", "data", 0, true);
pub const P_DOWNLOAD_DATA: PermissionDef = perm("download", "data", 0, true);
pub const P_DELETE_DATA: PermissionDef = perm("delete", "data", 0, true);
pub const P_INGEST_DATA: PermissionDef = perm("ingest", "data", 0, true);
pub const P_ANALYZE_DATA: PermissionDef = perm("analyze", "data", 0, true);
pub const P_EXPORT_DATA: PermissionDef = perm("export", "data", 0, true);

pub const P_CREATE_PROJECT: PermissionDef = perm("create", "project", 0, false);
pub const P_EDIT_PROJECT: PermissionDef = perm("edit", "project", 1, false);
pub const P_DELETE_PROJECT: PermissionDef = perm("delete", "project", 1, false);

pub const P_CREATE_DATASET: PermissionDef = perm("create", "dataset", 1, false);
pub const P_EDIT_DATASET: PermissionDef = perm("edit", "dataset", 1, false);
pub const P_DELETE_DATASET: PermissionDef = perm("delete", "dataset", 1, false);

pub const P_VIEW_PERMISSIONS: PermissionDef = perm("view", "permissions", 0, false);
pub const P_EDIT_PERMISSIONS: PermissionDef = perm("edit", "permissions", 0, false);
pub const P_VIEW_GROUPS: PermissionDef = perm("view", "groups", 0, false);
pub const P_EDIT_GROUPS: PermissionDef = perm("edit", "groups", 0, false);

pub const P_VIEW_PRIVATE_PORTAL: PermissionDef = perm("view", "private_portal", 0, false);

pub static PERMISSIONS: &[PermissionDef] = &[
    P_QUERY_PROJECT_LEVEL_BOOLEAN,
    P_QUERY_DATASET_LEVEL_BOOLEAN,
    P_QUERY_PROJECT_LEVEL_COUNTS,
    P_QUERY_DATASET_LEVEL_COUNTS,
    P_QUERY_DATA,
    P_DOWNLOAD_DATA,
    P_DELETE_DATA,
    P_INGEST_DATA,
    P_ANALYZE_DATA,
    P_EXPORT_DATA,
    P_CREATE_PROJECT,
    P_EDIT_PROJECT,
    P_DELETE_PROJECT,
    P_CREATE_DATASET,
    P_EDIT_DATASET,
    P_DELETE_DATASET,
    P_VIEW_PERMISSIONS,
    P_EDIT_PERMISSIONS,
    P_VIEW_GROUPS,
    P_EDIT_GROUPS,
    P_VIEW_PRIVATE_PORTAL,
];

static PERMISSIONS_BY_ID: Lazy<HashMap<String, &'static PermissionDef>> =
    Lazy::new(|| PERMISSIONS.iter().map(|p| (p.id(), p)).collect());

/// Look up a registered permission by its `verb:noun` id.
pub fn permission(id: &str) -> Option<&'static PermissionDef> {
    PERMISSIONS_BY_ID.get(id).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_well_formed() {
        assert_eq!(PERMISSIONS_BY_ID.len(), PERMISSIONS.len());
        for p in PERMISSIONS {
            let id = p.id();
            let (verb, noun) = id.split_once(':').expect("id must be verb:noun");
            assert_eq!(verb, p.verb);
            assert_eq!(noun, p.noun);
            assert!(p.min_specificity <= 3);
        }
    }

    #[test]
    fn lookup() {
        assert_eq!(permission("query:data"), Some(&P_QUERY_DATA));
        assert_eq!(permission("edit:permissions"), Some(&P_EDIT_PERMISSIONS));
        assert!(permission("query:everything").is_none());
    }

    #[test]
    fn project_scoped_permissions_require_a_project() {
        assert_eq!(P_DELETE_PROJECT.min_specificity, 1);
        assert_eq!(P_CREATE_DATASET.min_specificity, 1);
        assert_eq!(P_QUERY_DATA.min_specificity, 0);
    }
}
