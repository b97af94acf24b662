//! Grant and group data model.
//!
//! Subject and resource patterns travel as small structural JSON documents
//! (`{"everyone": true}`, `{"project": "p1", "dataset": "d1"}`, ...). They are
//! parsed into closed enums at every boundary; documents with unknown fields
//! or an unrecognized field combination are rejected there, so the rest of
//! the crate only ever pattern-matches on valid variants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::expr::MembershipExpr;

pub type GrantId = i64;
pub type GroupId = i64;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PatternError(pub &'static str);

/// Who a grant applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SubjectDoc", into = "SubjectDoc")]
pub enum SubjectPattern {
    /// Callers with no verified token.
    Anonymous,
    /// All callers, anonymous included.
    Everyone,
    /// Exact `(iss, azp, sub)` triple.
    IssuerClientSubject { iss: String, azp: String, sub: String },
    /// Any subject issued by `iss` to client `azp`.
    IssuerClient { iss: String, azp: String },
    /// `(iss, sub)` across clients.
    IssuerSubject { iss: String, sub: String },
    /// Membership in a stored group, checked at evaluation time.
    Group(GroupId),
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubjectDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    anonymous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    everyone: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<GroupId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    azp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
}

impl TryFrom<SubjectDoc> for SubjectPattern {
    type Error = PatternError;

    fn try_from(doc: SubjectDoc) -> Result<Self, Self::Error> {
        match doc {
            SubjectDoc {
                anonymous: Some(true),
                everyone: None,
                group: None,
                iss: None,
                azp: None,
                sub: None,
            } => Ok(Self::Anonymous),
            SubjectDoc {
                everyone: Some(true),
                anonymous: None,
                group: None,
                iss: None,
                azp: None,
                sub: None,
            } => Ok(Self::Everyone),
            SubjectDoc {
                group: Some(group),
                anonymous: None,
                everyone: None,
                iss: None,
                azp: None,
                sub: None,
            } => Ok(Self::Group(group)),
            SubjectDoc {
                iss: Some(iss),
                azp: Some(azp),
                sub: Some(sub),
                anonymous: None,
                everyone: None,
                group: None,
            } => Ok(Self::IssuerClientSubject { iss, azp, sub }),
            SubjectDoc {
                iss: Some(iss),
                azp: Some(azp),
                sub: None,
                anonymous: None,
                everyone: None,
                group: None,
            } => Ok(Self::IssuerClient { iss, azp }),
            SubjectDoc {
                iss: Some(iss),
                sub: Some(sub),
                azp: None,
                anonymous: None,
                everyone: None,
                group: None,
            } => Ok(Self::IssuerSubject { iss, sub }),
            _ => Err(PatternError("unrecognized subject pattern")),
        }
    }
}

impl From<SubjectPattern> for SubjectDoc {
    fn from(pattern: SubjectPattern) -> Self {
        let doc = SubjectDoc::default();
        match pattern {
            SubjectPattern::Anonymous => SubjectDoc {
                anonymous: Some(true),
                ..doc
            },
            SubjectPattern::Everyone => SubjectDoc {
                everyone: Some(true),
                ..doc
            },
            SubjectPattern::Group(group) => SubjectDoc {
                group: Some(group),
                ..doc
            },
            SubjectPattern::IssuerClientSubject { iss, azp, sub } => SubjectDoc {
                iss: Some(iss),
                azp: Some(azp),
                sub: Some(sub),
                ..doc
            },
            SubjectPattern::IssuerClient { iss, azp } => SubjectDoc {
                iss: Some(iss),
                azp: Some(azp),
                ..doc
            },
            SubjectPattern::IssuerSubject { iss, sub } => SubjectDoc {
                iss: Some(iss),
                sub: Some(sub),
                ..doc
            },
        }
    }
}

/// What a grant applies to: a point in the project → dataset → data-type
/// hierarchy, or everything.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ResourceDoc", into = "ResourceDoc")]
pub enum ResourcePattern {
    Everything,
    Project {
        project: String,
    },
    ProjectDataset {
        project: String,
        dataset: String,
    },
    ProjectDataType {
        project: String,
        data_type: String,
    },
    ProjectDatasetDataType {
        project: String,
        dataset: String,
        data_type: String,
    },
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    everything: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_type: Option<String>,
}

impl TryFrom<ResourceDoc> for ResourcePattern {
    type Error = PatternError;

    fn try_from(doc: ResourceDoc) -> Result<Self, Self::Error> {
        match doc {
            ResourceDoc {
                everything: Some(true),
                project: None,
                dataset: None,
                data_type: None,
            } => Ok(Self::Everything),
            ResourceDoc {
                everything: None,
                project: Some(project),
                dataset,
                data_type,
            } => Ok(match (dataset, data_type) {
                (None, None) => Self::Project { project },
                (Some(dataset), None) => Self::ProjectDataset { project, dataset },
                (None, Some(data_type)) => Self::ProjectDataType { project, data_type },
                (Some(dataset), Some(data_type)) => Self::ProjectDatasetDataType {
                    project,
                    dataset,
                    data_type,
                },
            }),
            _ => Err(PatternError("unrecognized resource pattern")),
        }
    }
}

impl From<ResourcePattern> for ResourceDoc {
    fn from(pattern: ResourcePattern) -> Self {
        let doc = ResourceDoc::default();
        match pattern {
            ResourcePattern::Everything => ResourceDoc {
                everything: Some(true),
                ..doc
            },
            ResourcePattern::Project { project } => ResourceDoc {
                project: Some(project),
                ..doc
            },
            ResourcePattern::ProjectDataset { project, dataset } => ResourceDoc {
                project: Some(project),
                dataset: Some(dataset),
                ..doc
            },
            ResourcePattern::ProjectDataType { project, data_type } => ResourceDoc {
                project: Some(project),
                data_type: Some(data_type),
                ..doc
            },
            ResourcePattern::ProjectDatasetDataType {
                project,
                dataset,
                data_type,
            } => ResourceDoc {
                project: Some(project),
                dataset: Some(dataset),
                data_type: Some(data_type),
                ..doc
            },
        }
    }
}

impl ResourcePattern {
    /// Height in the cascade lattice. Dataset- and data-type-scoped patterns
    /// share a level; see [`ResourcePattern::cascade_rank`] for the ordering
    /// used to break that tie.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Everything => 0,
            Self::Project { .. } => 1,
            Self::ProjectDataset { .. } | Self::ProjectDataType { .. } => 2,
            Self::ProjectDatasetDataType { .. } => 3,
        }
    }

    /// Total order used when the cascade compares grants: dataset scope beats
    /// data-type scope at the same specificity level.
    pub fn cascade_rank(&self) -> u8 {
        match self {
            Self::Everything => 0,
            Self::Project { .. } => 1,
            Self::ProjectDataType { .. } => 2,
            Self::ProjectDataset { .. } => 3,
            Self::ProjectDatasetDataType { .. } => 4,
        }
    }

    fn project(&self) -> Option<&str> {
        match self {
            Self::Everything => None,
            Self::Project { project }
            | Self::ProjectDataset { project, .. }
            | Self::ProjectDataType { project, .. }
            | Self::ProjectDatasetDataType { project, .. } => Some(project),
        }
    }

    /// Set-inclusion test: does this (grant) pattern cover the requested
    /// resource? A requested `everything` is covered only by an `everything`
    /// grant.
    pub fn covers(&self, requested: &ResourcePattern) -> bool {
        match self {
            Self::Everything => true,
            Self::Project { project } => requested.project() == Some(project),
            Self::ProjectDataset { project, dataset } => match requested {
                Self::ProjectDataset {
                    project: r_project,
                    dataset: r_dataset,
                }
                | Self::ProjectDatasetDataType {
                    project: r_project,
                    dataset: r_dataset,
                    ..
                } => project == r_project && dataset == r_dataset,
                _ => false,
            },
            Self::ProjectDataType { project, data_type } => match requested {
                Self::ProjectDataType {
                    project: r_project,
                    data_type: r_data_type,
                }
                | Self::ProjectDatasetDataType {
                    project: r_project,
                    data_type: r_data_type,
                    ..
                } => project == r_project && data_type == r_data_type,
                _ => false,
            },
            Self::ProjectDatasetDataType { .. } => self == requested,
        }
    }
}

/// A permission assignment: `subject` holds (or, when negated, is denied)
/// `permission` on `resource`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub subject: SubjectPattern,
    pub resource: ResourcePattern,
    pub permission: String,
    #[serde(default)]
    pub negated: bool,
    #[serde(default = "empty_object")]
    pub extra: Value,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredGrant {
    pub id: GrantId,
    #[serde(flatten)]
    pub grant: Grant,
    pub created: DateTime<Utc>,
}

impl StoredGrant {
    /// Active over the half-open window `[created, expiry)`.
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.created <= now && self.grant.expiry.is_none_or(|expiry| now < expiry)
    }
}

/// A named, reusable subject set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub membership: GroupMembership,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub id: GroupId,
    #[serde(flatten)]
    pub group: Group,
    pub created: DateTime<Utc>,
}

impl StoredGroup {
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.created <= now && self.group.expiry.is_none_or(|expiry| now < expiry)
    }
}

/// Group membership: an explicit member list, or a claim expression evaluated
/// against the caller's verified claims.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupMembership {
    Members(MemberList),
    Expr(ExprMembership),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberList {
    pub members: Vec<GroupMember>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExprMembership {
    pub expr: MembershipExpr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupMember {
    IssuerClientSubject(IssuerClientSubjectMember),
    IssuerSubject(IssuerSubjectMember),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuerClientSubjectMember {
    pub iss: String,
    pub azp: String,
    pub sub: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuerSubjectMember {
    pub iss: String,
    pub sub: String,
}

/// The caller identity a request evaluates as. Built from verified claims or
/// the anonymous marker; a pure mapping with no I/O.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedSubject {
    pub anonymous: bool,
    pub iss: Option<String>,
    pub sub: Option<String>,
    pub azp: Option<String>,
    pub claims: Option<Value>,
}

impl ResolvedSubject {
    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            ..Self::default()
        }
    }

    pub fn from_claims(claims: Value) -> Self {
        let field = |name: &str| {
            claims
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        Self {
            anonymous: false,
            iss: field("iss"),
            sub: field("sub"),
            azp: field("azp"),
            claims: Some(claims),
        }
    }
}
