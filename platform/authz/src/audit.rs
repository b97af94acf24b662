//! Structured audit records for policy decisions.
//!
//! One record per top-level evaluation. Emission goes through `tracing`
//! (target `audit`) and can never fail the request that produced it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::model::{GrantId, ResolvedSubject, ResourcePattern};

#[derive(Debug, Serialize)]
pub struct DecisionRecord<'a> {
    pub ts: DateTime<Utc>,
    pub caller_iss: Option<&'a str>,
    pub caller_sub: Option<&'a str>,
    pub requested_resources: &'a [ResourcePattern],
    pub requested_permissions: &'a [String],
    pub decision: bool,
    pub matched_grant_ids: &'a [GrantId],
}

impl<'a> DecisionRecord<'a> {
    pub fn new(
        ts: DateTime<Utc>,
        caller: &'a ResolvedSubject,
        requested_resources: &'a [ResourcePattern],
        requested_permissions: &'a [String],
        decision: bool,
        matched_grant_ids: &'a [GrantId],
    ) -> Self {
        Self {
            ts,
            caller_iss: caller.iss.as_deref(),
            caller_sub: caller.sub.as_deref(),
            requested_resources,
            requested_permissions,
            decision,
            matched_grant_ids,
        }
    }

    pub fn emit(&self) {
        let resources =
            serde_json::to_string(self.requested_resources).unwrap_or_else(|_| "[]".into());
        info!(
            target: "audit",
            ts = %self.ts.to_rfc3339(),
            caller_iss = self.caller_iss.unwrap_or("anonymous"),
            caller_sub = self.caller_sub.unwrap_or("anonymous"),
            resources = %resources,
            permissions = ?self.requested_permissions,
            decision = self.decision,
            matched_grant_ids = ?self.matched_grant_ids,
            "authorization decision"
        );
    }
}
