//! Role Resolver: maps a classifier's free-text verb (or an
//! already-canonical role name) onto one of the configured roles, using
//! the `semantic_verbs` synonym table.

use crate::config::SystemConfig;
use crate::error::RoleError;

/// Roles with a fixed tie-break priority ahead of any custom role, in
/// that priority order. Only `router`, `reasoning` and `coding` are
/// actually required to exist in a valid config (enforced at
/// config-validate time) — `summarization` and `analysis` are canonical
/// when present but optional.
pub const CANONICAL_ROLES: [&str; 5] = ["router", "reasoning", "coding", "summarization", "analysis"];

fn normalize(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Resolves `input` — a canonical role name or a classifier-produced verb
/// — to the role it should dispatch to.
///
/// Resolution order: exact canonical/custom role name match first, then a
/// `semantic_verbs` synonym lookup. When more than one role's synonym set
/// contains the normalized verb, canonical roles win over custom ones, in
/// `CANONICAL_ROLES` order, then custom roles break ties alphabetically —
/// this keeps resolution deterministic without needing the caller to
/// supply a priority.
pub fn resolve_role(input: &str, config: &SystemConfig) -> Result<String, RoleError> {
    let normalized = normalize(input);

    if config.roles.contains_key(&normalized) {
        return Ok(normalized);
    }

    let mut matches: Vec<&String> = config
        .semantic_verbs
        .iter()
        .filter(|(_, synonyms)| synonyms.contains(&normalized))
        .map(|(role, _)| role)
        .collect();

    if matches.is_empty() {
        return Err(RoleError::Unknown(input.to_string()));
    }

    matches.sort_by_key(|role| {
        CANONICAL_ROLES
            .iter()
            .position(|canonical| canonical == role.as_str())
            .map(|pos| (0, pos))
            .unwrap_or((1, 0))
    });
    // Stable tie-break among non-canonical roles: alphabetical.
    if matches.len() > 1 {
        let all_custom = matches
            .iter()
            .all(|role| !CANONICAL_ROLES.contains(&role.as_str()));
        if all_custom {
            matches.sort();
        }
    }

    Ok(matches[0].clone())
}

/// Looks up the configured model chain for a role that has already been
/// resolved to a known key in `config.roles`.
pub fn chain_for<'a>(role: &str, config: &'a SystemConfig) -> Result<&'a [String], RoleError> {
    config
        .roles
        .get(role)
        .map(|chain| chain.ids())
        .ok_or_else(|| RoleError::Missing(role.to_string()))
}
