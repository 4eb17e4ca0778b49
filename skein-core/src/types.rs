//! Identity types.
//!
//! - [`ServiceIdentity`]: immutable `(name, version)` pair rendered as the
//!   `name@version` entity string carried by every envelope
//! - [`NodeId`]: opaque id of one running process, used to address replies
//! - [`TransportKind`]: which bus a client talks through

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable service identity.
///
/// The name is lower-cased on construction and the version is kept as a
/// string, so `ServiceIdentity::new("Calc", 1.0)` and
/// `ServiceIdentity::new("calc", "1.0")` denote the same entity.
///
/// # Examples
///
/// ```
/// use skein_core::ServiceIdentity;
///
/// let id = ServiceIdentity::new("Calc", "1.0");
/// assert_eq!(id.name(), "calc");
/// assert_eq!(id.entity(), "calc@1.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    name: String,
    version: String,
}

impl ServiceIdentity {
    /// Create an identity from a name and any displayable version.
    pub fn new(name: impl AsRef<str>, version: impl fmt::Display) -> Self {
        Self {
            name: name.as_ref().to_lowercase(),
            version: version.to_string(),
        }
    }

    /// Parse an entity string of the form `name@version`.
    ///
    /// The split happens at the last `@`, so names may not contain `@` but
    /// versions are taken verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the separator is missing or either side is empty.
    pub fn parse(entity: &str) -> Result<Self, IdentityParseError> {
        let (name, version) = entity
            .rsplit_once('@')
            .ok_or(IdentityParseError::MissingSeparator)?;
        if name.is_empty() {
            return Err(IdentityParseError::EmptyName);
        }
        if version.is_empty() {
            return Err(IdentityParseError::EmptyVersion);
        }
        Ok(Self::new(name, version))
    }

    /// Lower-cased service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The `name@version` entity string.
    pub fn entity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Whether an inbound `name@version` entity is addressed to this identity.
    pub fn is_for_me(&self, entity: &str) -> bool {
        entity
            .rsplit_once('@')
            .is_some_and(|(name, version)| name == self.name && version == self.version)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Error parsing a `name@version` entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    /// No `@` separator.
    #[error("entity must be of the form name@version")]
    MissingSeparator,
    /// Nothing before the `@`.
    #[error("entity name is empty")]
    EmptyName,
    /// Nothing after the `@`.
    #[error("entity version is empty")]
    EmptyVersion,
}

/// Opaque identifier of one running process.
///
/// Each bus generates a fresh node id at startup. Requests carry the
/// caller's node id in `from`; responses copy it into `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing node id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Transport kind a bus is bound to.
///
/// Attaching a bus to a host only rebinds the clients of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Long-lived TCP connections carrying framed envelopes.
    Tcp,
    /// HTTP façade, served outside this workspace.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_lowercases_name() {
        let id = ServiceIdentity::new("Identity_Service", 2);
        assert_eq!(id.name(), "identity_service");
        assert_eq!(id.version(), "2");
        assert_eq!(id.entity(), "identity_service@2");
        assert_eq!(id.to_string(), id.entity());
    }

    #[test]
    fn test_identity_parse() {
        let id = ServiceIdentity::parse("Calc@1.0").expect("parse");
        assert_eq!(id, ServiceIdentity::new("calc", "1.0"));

        assert_eq!(
            ServiceIdentity::parse("calc"),
            Err(IdentityParseError::MissingSeparator)
        );
        assert_eq!(
            ServiceIdentity::parse("@1.0"),
            Err(IdentityParseError::EmptyName)
        );
        assert_eq!(
            ServiceIdentity::parse("calc@"),
            Err(IdentityParseError::EmptyVersion)
        );
    }

    #[test]
    fn test_is_for_me() {
        let id = ServiceIdentity::new("calc", "1.0");
        assert!(id.is_for_me("calc@1.0"));
        assert!(!id.is_for_me("calc@1.1"));
        assert!(!id.is_for_me("other@1.0"));
        assert!(!id.is_for_me("calc"));
    }

    #[test]
    fn test_node_id_serde_transparent() {
        let node = NodeId::new("abc123");
        let json = serde_json::to_string(&node).expect("serialize");
        assert_eq!(json, "\"abc123\"");
        let decoded: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, node);
    }
}
