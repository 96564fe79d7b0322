//! Naming rules for workflow executions and deployment units.
//!
//! Repository identifiers may carry a sub-template suffix (`infra-repo:vpc`).
//! The full identifier is kept everywhere in the ledgers; only names handed
//! to external systems are reduced to their safe alphabets.

use sha2::{Digest, Sha256};

/// Separator between a repository and its sub-template suffix.
pub const SUB_TEMPLATE_SEPARATOR: char = ':';

/// Maximum execution name length accepted by the workflow engine.
pub const MAX_EXECUTION_NAME_LEN: usize = 80;

/// Maximum deployment unit name length accepted by the provider.
pub const MAX_UNIT_NAME_LEN: usize = 128;

/// Split `repo:suffix` into its parts.
pub fn split_repository(repository: &str) -> (&str, Option<&str>) {
    match repository.split_once(SUB_TEMPLATE_SEPARATOR) {
        Some((base, suffix)) if !suffix.is_empty() => (base, Some(suffix)),
        Some((base, _)) => (base, None),
        None => (repository, None),
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `-`.
pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Derive the stable execution name for a build.
///
/// The same (repository, environment, build) always yields the same name,
/// which lets the engine reject a duplicate start of the same build.
pub fn execution_name(repository: &str, environment: &str, build_id: &str) -> String {
    let (base, suffix) = split_repository(repository);
    let repo_part = match suffix {
        Some(suffix) => format!("{base}-{suffix}"),
        None => base.to_string(),
    };
    let name = sanitize(&format!("{repo_part}-{environment}-{build_id}"));
    truncate_with_digest(&name, repository, environment, build_id, MAX_EXECUTION_NAME_LEN)
}

/// Derive the deployment unit name for a repository/environment pair.
///
/// Unit names must start with a letter and only contain `[A-Za-z0-9-]`.
pub fn unit_name(repository: &str, environment: &str) -> String {
    let raw = sanitize(&format!("{repository}-{environment}")).replace('_', "-");
    let name = if raw.starts_with(|c: char| c.is_ascii_alphabetic()) {
        raw
    } else {
        format!("u-{raw}")
    };
    truncate_with_digest(&name, repository, environment, "", MAX_UNIT_NAME_LEN)
}

fn truncate_with_digest(name: &str, a: &str, b: &str, c: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(a.as_bytes());
    hasher.update([0u8]);
    hasher.update(b.as_bytes());
    hasher.update([0u8]);
    hasher.update(c.as_bytes());
    let digest = hex::encode(&hasher.finalize()[..4]);
    // Sanitized names are pure ASCII, so byte slicing is safe.
    let keep = max - digest.len() - 1;
    format!("{}-{digest}", &name[..keep])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_suffix() {
        assert_eq!(split_repository("infra:vpc"), ("infra", Some("vpc")));
        assert_eq!(split_repository("infra"), ("infra", None));
        assert_eq!(split_repository("infra:"), ("infra", None));
    }

    #[test]
    fn execution_name_substitutes_illegal_characters() {
        let name = execution_name("org/infra:vpc", "dev", "0190a1b2");
        assert_eq!(name, "org-infra-vpc-dev-0190a1b2");
    }

    #[test]
    fn execution_name_is_stable() {
        let a = execution_name("infra", "prd", "build-1");
        let b = execution_name("infra", "prd", "build-1");
        assert_eq!(a, b);
    }

    #[test]
    fn long_execution_names_are_truncated_uniquely() {
        let repo = "r".repeat(100);
        let a = execution_name(&repo, "dev", "build-1");
        let b = execution_name(&repo, "dev", "build-2");
        assert_eq!(a.len(), MAX_EXECUTION_NAME_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn unit_name_starts_with_letter() {
        assert_eq!(unit_name("infra", "dev"), "infra-dev");
        assert_eq!(unit_name("9lives", "dev"), "u-9lives-dev");
        assert_eq!(unit_name("net_core:vpc", "stg"), "net-core-vpc-stg");
    }
}
