//! The policy evaluation engine.
//!
//! Evaluation is deterministic for a fixed `(now, snapshot, inputs)` triple:
//! it reads one store snapshot, never caches, and never feeds results back
//! into the store.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{
    GrantId, GroupId, GroupMember, GroupMembership, ResolvedSubject, ResourcePattern, StoredGrant,
    StoredGroup, SubjectPattern,
};
use crate::permissions::{PERMISSIONS, PermissionDef};

/// A bootstrap principal granted every permission on every resource, from
/// environment configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperuserPrincipal {
    pub iss: String,
    pub sub: String,
}

/// Result of one `evaluate` call: row per requested resource, column per
/// requested permission, plus the ids of the grants that produced the allows.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationOutcome {
    pub result: Vec<Vec<bool>>,
    pub matched_grant_ids: Vec<GrantId>,
}

impl EvaluationOutcome {
    /// True iff every requested cell is an allow.
    pub fn decision(&self) -> bool {
        self.result.iter().flatten().all(|allowed| *allowed)
    }
}

/// Evaluates decisions against one consistent snapshot of grants and groups.
pub struct Evaluator<'a> {
    grants: &'a [StoredGrant],
    groups: &'a HashMap<GroupId, StoredGroup>,
    superusers: &'a [SuperuserPrincipal],
    now: DateTime<Utc>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        grants: &'a [StoredGrant],
        groups: &'a HashMap<GroupId, StoredGroup>,
        superusers: &'a [SuperuserPrincipal],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            grants,
            groups,
            superusers,
            now,
        }
    }

    /// Decision matrix for the requested resources × permissions.
    pub fn evaluate(
        &self,
        subject: &ResolvedSubject,
        resources: &[ResourcePattern],
        permissions: &[&'static PermissionDef],
    ) -> EvaluationOutcome {
        if self.is_superuser(subject) {
            return EvaluationOutcome {
                result: vec![vec![true; permissions.len()]; resources.len()],
                matched_grant_ids: Vec::new(),
            };
        }

        let mut matched = BTreeSet::new();
        let result = resources
            .iter()
            .map(|resource| {
                permissions
                    .iter()
                    .map(|permission| {
                        let cell = self.decide(subject, resource, permission);
                        matched.extend(cell.grant_ids);
                        cell.allow
                    })
                    .collect()
            })
            .collect();

        EvaluationOutcome {
            result,
            matched_grant_ids: matched.into_iter().collect(),
        }
    }

    /// All registry permissions the subject holds on each requested resource,
    /// as sorted `verb:noun` ids.
    pub fn permissions_for(
        &self,
        subject: &ResolvedSubject,
        resources: &[ResourcePattern],
    ) -> Vec<Vec<String>> {
        let superuser = self.is_superuser(subject);
        resources
            .iter()
            .map(|resource| {
                let mut held: Vec<String> = PERMISSIONS
                    .iter()
                    .filter(|permission| {
                        superuser || self.decide(subject, resource, permission).allow
                    })
                    .map(PermissionDef::id)
                    .collect();
                held.sort();
                held
            })
            .collect()
    }

    fn is_superuser(&self, subject: &ResolvedSubject) -> bool {
        if subject.anonymous {
            return false;
        }
        let (Some(iss), Some(sub)) = (&subject.iss, &subject.sub) else {
            return false;
        };
        self.superusers
            .iter()
            .any(|principal| principal.iss == *iss && principal.sub == *sub)
    }

    /// One cell of the matrix. Matching grants are bucketed by cascade rank;
    /// a positive bucket wins only when it is strictly more specific than
    /// every negation, so a rank tie resolves to deny.
    fn decide(
        &self,
        subject: &ResolvedSubject,
        resource: &ResourcePattern,
        permission: &PermissionDef,
    ) -> CellDecision {
        let permission_id = permission.id();
        let mut best_positive: Option<(u8, Vec<GrantId>)> = None;
        let mut best_negation: Option<u8> = None;

        for stored in self.grants {
            if !stored.active_at(self.now) {
                continue;
            }
            let grant = &stored.grant;
            if grant.permission != permission_id {
                continue;
            }
            // Should have been rejected at write time; treat as inactive.
            if grant.resource.specificity() < permission.min_specificity {
                warn!(
                    grant = stored.id,
                    permission = %permission_id,
                    "grant sits below its permission's minimum resource specificity; ignoring"
                );
                continue;
            }
            if !grant.resource.covers(resource) {
                continue;
            }
            if !self.subject_matches(&grant.subject, subject) {
                continue;
            }

            let rank = grant.resource.cascade_rank();
            if grant.negated {
                best_negation = Some(best_negation.map_or(rank, |current| current.max(rank)));
            } else if let Some((best_rank, ids)) = best_positive.as_mut() {
                if rank > *best_rank {
                    *best_rank = rank;
                    ids.clear();
                    ids.push(stored.id);
                } else if rank == *best_rank {
                    ids.push(stored.id);
                }
            } else {
                best_positive = Some((rank, vec![stored.id]));
            }
        }

        match best_positive {
            Some((rank, grant_ids)) if best_negation.is_none_or(|negation| rank > negation) => {
                CellDecision {
                    allow: true,
                    grant_ids,
                }
            }
            _ => CellDecision {
                allow: false,
                grant_ids: Vec::new(),
            },
        }
    }

    fn subject_matches(&self, pattern: &SubjectPattern, subject: &ResolvedSubject) -> bool {
        match pattern {
            SubjectPattern::Everyone => true,
            SubjectPattern::Anonymous => subject.anonymous,
            SubjectPattern::IssuerClientSubject { iss, azp, sub } => {
                !subject.anonymous
                    && subject.iss.as_deref() == Some(iss)
                    && subject.azp.as_deref() == Some(azp)
                    && subject.sub.as_deref() == Some(sub)
            }
            SubjectPattern::IssuerClient { iss, azp } => {
                !subject.anonymous
                    && subject.iss.as_deref() == Some(iss)
                    && subject.azp.as_deref() == Some(azp)
            }
            SubjectPattern::IssuerSubject { iss, sub } => {
                !subject.anonymous
                    && subject.iss.as_deref() == Some(iss)
                    && subject.sub.as_deref() == Some(sub)
            }
            SubjectPattern::Group(group) => self.group_contains(*group, subject),
        }
    }

    fn group_contains(&self, group_id: GroupId, subject: &ResolvedSubject) -> bool {
        let Some(group) = self.groups.get(&group_id) else {
            warn!(group = group_id, "grant references a missing group; treating as no match");
            return false;
        };
        if !group.active_at(self.now) {
            return false;
        }
        if subject.anonymous {
            // Anonymous callers are never group members.
            return false;
        }
        match &group.group.membership {
            GroupMembership::Members(list) => list
                .members
                .iter()
                .any(|member| member_matches(member, subject)),
            GroupMembership::Expr(membership) => subject
                .claims
                .as_ref()
                .is_some_and(|claims| membership.expr.evaluate(claims)),
        }
    }
}

fn member_matches(member: &GroupMember, subject: &ResolvedSubject) -> bool {
    match member {
        GroupMember::IssuerClientSubject(m) => {
            subject.iss.as_deref() == Some(&m.iss)
                && subject.azp.as_deref() == Some(&m.azp)
                && subject.sub.as_deref() == Some(&m.sub)
        }
        GroupMember::IssuerSubject(m) => {
            subject.iss.as_deref() == Some(&m.iss) && subject.sub.as_deref() == Some(&m.sub)
        }
    }
}

struct CellDecision {
    allow: bool,
    grant_ids: Vec<GrantId>,
}
