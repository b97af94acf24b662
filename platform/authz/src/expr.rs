//! Boolean expression trees over token claims, used by expression-backed
//! groups. Evaluation short-circuits; a missing claim makes the enclosing
//! predicate false rather than erroring.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MembershipExpr {
    And(AndExpr),
    Or(OrExpr),
    Not(NotExpr),
    Claim(ClaimExpr),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AndExpr {
    pub and: Vec<MembershipExpr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrExpr {
    pub or: Vec<MembershipExpr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotExpr {
    pub not: Box<MembershipExpr>,
}

/// Leaf predicate comparing a dotted claim path against a constant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimExpr {
    pub claim: String,
    pub op: ClaimOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOp {
    Eq,
    Ne,
    In,
    Contains,
}

impl MembershipExpr {
    pub fn evaluate(&self, claims: &Value) -> bool {
        match self {
            Self::And(node) => node.and.iter().all(|e| e.evaluate(claims)),
            Self::Or(node) => node.or.iter().any(|e| e.evaluate(claims)),
            Self::Not(node) => !node.not.evaluate(claims),
            Self::Claim(leaf) => leaf.evaluate(claims),
        }
    }
}

impl ClaimExpr {
    fn evaluate(&self, claims: &Value) -> bool {
        let Some(actual) = lookup_path(claims, &self.claim) else {
            return false;
        };
        match self.op {
            ClaimOp::Eq => *actual == self.value,
            ClaimOp::Ne => *actual != self.value,
            ClaimOp::In => self
                .value
                .as_array()
                .is_some_and(|options| options.contains(actual)),
            ClaimOp::Contains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
        }
    }
}

fn lookup_path<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = claims;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expr(doc: Value) -> MembershipExpr {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn leaf_operators() {
        let claims = json!({
            "email_verified": true,
            "realm": "alpha",
            "roles": ["curator", "reader"],
        });

        assert!(expr(json!({"claim": "email_verified", "op": "eq", "value": true}))
            .evaluate(&claims));
        assert!(!expr(json!({"claim": "email_verified", "op": "eq", "value": false}))
            .evaluate(&claims));
        assert!(expr(json!({"claim": "realm", "op": "ne", "value": "beta"})).evaluate(&claims));
        assert!(
            expr(json!({"claim": "realm", "op": "in", "value": ["alpha", "beta"]}))
                .evaluate(&claims)
        );
        assert!(
            expr(json!({"claim": "roles", "op": "contains", "value": "curator"}))
                .evaluate(&claims)
        );
        assert!(
            !expr(json!({"claim": "roles", "op": "contains", "value": "admin"})).evaluate(&claims)
        );
    }

    #[test]
    fn missing_claims_are_false_not_errors() {
        let claims = json!({"sub": "u"});
        for op in ["eq", "ne", "in", "contains"] {
            assert!(
                !expr(json!({"claim": "absent", "op": op, "value": "x"})).evaluate(&claims),
                "op {op} on a missing claim should be false"
            );
        }
        // Dotted path into a non-object is also just false.
        assert!(!expr(json!({"claim": "sub.deeper", "op": "eq", "value": "x"})).evaluate(&claims));
    }

    #[test]
    fn nested_paths_and_combinators() {
        let claims = json!({
            "resource_access": {"portal": {"roles": ["viewer"]}},
            "iss": "https://idp.example.org",
        });

        let tree = expr(json!({
            "and": [
                {"claim": "iss", "op": "eq", "value": "https://idp.example.org"},
                {"or": [
                    {"claim": "resource_access.portal.roles", "op": "contains", "value": "admin"},
                    {"claim": "resource_access.portal.roles", "op": "contains", "value": "viewer"},
                ]},
                {"not": {"claim": "blocked", "op": "eq", "value": true}},
            ]
        }));
        assert!(tree.evaluate(&claims));

        let blocked = json!({
            "resource_access": {"portal": {"roles": ["viewer"]}},
            "iss": "https://idp.example.org",
            "blocked": true,
        });
        assert!(!tree.evaluate(&blocked));
    }

    #[test]
    fn unknown_node_shapes_are_rejected_at_parse_time() {
        assert!(serde_json::from_value::<MembershipExpr>(json!({"xor": []})).is_err());
        assert!(
            serde_json::from_value::<MembershipExpr>(
                json!({"claim": "a", "op": "matches", "value": 1})
            )
            .is_err()
        );
    }
}
