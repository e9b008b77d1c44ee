use crate::models::OrganizationCandidate;

/// Capability token marking an account with premium usage quotas.
pub const PREMIUM_USAGE_CAPABILITY: &str = "raven";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No organizations found")]
    NoCandidates,
}

type Predicate = fn(&OrganizationCandidate) -> bool;

/// Selection rules in priority order. Each rule is a full pass over the list.
const PRIORITIES: &[(&str, Predicate)] = &[
    ("billing", has_billing_plan),
    ("tier", has_feature_tier),
    ("capability", has_premium_capability),
];

fn non_empty(tag: &Option<String>) -> bool {
    tag.as_deref().is_some_and(|t| !t.is_empty())
}

pub fn has_billing_plan(org: &OrganizationCandidate) -> bool {
    non_empty(&org.billing_type)
}

pub fn has_feature_tier(org: &OrganizationCandidate) -> bool {
    non_empty(&org.raven_type)
}

pub fn has_premium_capability(org: &OrganizationCandidate) -> bool {
    org.capabilities()
        .iter()
        .any(|c| c == PREMIUM_USAGE_CAPABILITY)
}

/// Pick the organization whose usage should be tracked.
///
/// Paid accounts win over tiered ones, tiered over capability-tagged ones,
/// and the first listed account is the fallback.
pub fn resolve(candidates: &[OrganizationCandidate]) -> Result<String, ResolveError> {
    let first = candidates.first().ok_or(ResolveError::NoCandidates)?;

    for (rule, matches) in PRIORITIES {
        if let Some(org) = candidates.iter().find(|org| matches(org)) {
            tracing::debug!(org = %org.uuid, name = ?org.name, rule, "Resolved organization");
            return Ok(org.uuid.clone());
        }
    }

    tracing::debug!(org = %first.uuid, name = ?first.name, "Using first organization (fallback)");
    Ok(first.uuid.clone())
}
