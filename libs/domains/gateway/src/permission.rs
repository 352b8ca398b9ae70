//! Pure authorization check.
//!
//! [`evaluate`] depends only on its arguments: no clock, no I/O, no shared
//! state. The same inputs always produce the same [`Decision`].

use crate::models::{Action, Credential, ResourcePath};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    MissingPermission(Action),
    OutOfScope(ResourcePath),
    /// Tenant-wide operation requested by a scoped credential
    ScopedCredential(Action),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::MissingPermission(action) => write!(
                f,
                "credential lacks '{}' permission required for {}",
                action.required_permission(),
                action
            ),
            DenyReason::OutOfScope(path) => {
                write!(f, "resource '{}' is outside the credential scope", path)
            }
            DenyReason::ScopedCredential(action) => {
                write!(f, "{} requires a credential without a scope", action)
            }
        }
    }
}

/// Decide whether `credential` may perform `action` on `target`.
///
/// `target` is `None` for tenant-wide operations (listing databases, key
/// management). A scoped credential may only *read* tenant-wide, and the
/// caller filters what it returns through [`is_visible`].
pub fn evaluate(credential: &Credential, action: Action, target: Option<&ResourcePath>) -> Decision {
    if !credential.has_permission(action.required_permission()) {
        return Decision::Deny(DenyReason::MissingPermission(action));
    }

    let Some(scope) = &credential.scope else {
        return Decision::Allow;
    };

    match target {
        Some(path) if scope.iter().any(|pattern| pattern.matches(path)) => Decision::Allow,
        Some(path) => Decision::Deny(DenyReason::OutOfScope(path.clone())),
        None if action == Action::Read => Decision::Allow,
        None => Decision::Deny(DenyReason::ScopedCredential(action)),
    }
}

/// Whether a listing may show `path` to `credential`.
///
/// A database is visible when it, or any table inside it, is in scope.
pub fn is_visible(credential: &Credential, path: &ResourcePath) -> bool {
    let Some(scope) = &credential.scope else {
        return true;
    };
    scope.iter().any(|pattern| {
        pattern.matches(path)
            || (!path.is_table() && pattern.path().database == path.database)
    })
}
