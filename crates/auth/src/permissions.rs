use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are modeled as opaque strings (e.g. "session.write").
/// A special wildcard permission `"*"` grants everything; it is meant for
/// system callers, never for tokens issued to end users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

/// Update a session without presenting its token.
pub const SESSION_WRITE: Permission = Permission(Cow::Borrowed("session.write"));
/// Terminate a session without presenting its token.
pub const SESSION_DELETE: Permission = Permission(Cow::Borrowed("session.delete"));

impl Permission {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `granted` covers `required` (exact match or wildcard).
pub fn has_permission(granted: &[Permission], required: &Permission) -> bool {
    granted.iter().any(|p| p.is_wildcard() || p == required)
}
