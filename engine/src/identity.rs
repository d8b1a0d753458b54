//! Identity keys naming records.
//!
//! A record is named by its class and either the server-assigned object id or,
//! until its first save completes, a process-local token.

use crate::{error::Result, ClassName, Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every record key in durable storage.
pub const OBJECT_KEY_PREFIX: &str = "obj:";

const LOCAL_ID_PREFIX: &str = "local_";

/// Identifier of a record: server-assigned or local.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ObjectId {
    /// Assigned by the remote service on first save
    Server(String),
    /// Process-local token for an unsaved record
    Local(String),
}

impl ObjectId {
    /// Whether this identifier was assigned by the server.
    pub fn is_server(&self) -> bool {
        matches!(self, ObjectId::Server(_))
    }

    /// Server id, if assigned.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            ObjectId::Server(id) => Some(id),
            ObjectId::Local(_) => None,
        }
    }

    /// Local token, if unsaved.
    pub fn local_id(&self) -> Option<&str> {
        match self {
            ObjectId::Server(_) => None,
            ObjectId::Local(token) => Some(token),
        }
    }

    /// Form used inside storage keys. Server ids are alphanumeric, so the
    /// `local_` prefix cannot collide with them.
    pub fn storage_id(&self) -> String {
        match self {
            ObjectId::Server(id) => id.clone(),
            ObjectId::Local(token) => format!("{LOCAL_ID_PREFIX}{token}"),
        }
    }

    /// Parse the form produced by [`ObjectId::storage_id`].
    pub fn from_storage_id(raw: &str) -> Self {
        match raw.strip_prefix(LOCAL_ID_PREFIX) {
            Some(token) => ObjectId::Local(token.to_string()),
            None => ObjectId::Server(raw.to_string()),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_id())
    }
}

/// The (class, id) pair uniquely naming a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKey {
    pub class_name: ClassName,
    pub id: ObjectId,
}

impl IdentityKey {
    /// Create a key, validating the class name.
    pub fn new(class_name: impl Into<ClassName>, id: ObjectId) -> Result<Self> {
        let class_name = class_name.into();
        validate_class_name(&class_name)?;
        Ok(Self { class_name, id })
    }

    /// Key for a record with a server-assigned id.
    pub fn server(class_name: impl Into<ClassName>, object_id: impl Into<String>) -> Result<Self> {
        Self::new(class_name, ObjectId::Server(object_id.into()))
    }

    /// Key for an unsaved record.
    pub fn local(class_name: impl Into<ClassName>, token: impl Into<String>) -> Result<Self> {
        Self::new(class_name, ObjectId::Local(token.into()))
    }

    /// Key under which the record lives in durable storage.
    pub fn storage_key(&self) -> String {
        format!(
            "{OBJECT_KEY_PREFIX}{}:{}",
            self.class_name,
            self.id.storage_id()
        )
    }

    /// Parse a key produced by [`IdentityKey::storage_key`].
    pub fn from_storage_key(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix(OBJECT_KEY_PREFIX)
            .ok_or_else(|| Error::InvalidEncoding(format!("not an object key: {raw}")))?;
        let (class_name, id) = rest
            .split_once(':')
            .ok_or_else(|| Error::InvalidEncoding(format!("malformed object key: {raw}")))?;
        if id.is_empty() {
            return Err(Error::InvalidEncoding(format!("malformed object key: {raw}")));
        }
        Self::new(class_name, ObjectId::from_storage_id(id))
    }

    /// Storage prefix shared by every record of a class.
    pub fn class_prefix(class_name: &str) -> String {
        format!("{OBJECT_KEY_PREFIX}{class_name}:")
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.id)
    }
}

/// Class names must be non-empty and free of the key separator.
pub fn validate_class_name(class_name: &str) -> Result<()> {
    if class_name.is_empty() || class_name.contains(':') {
        return Err(Error::InvalidClassName(class_name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_roundtrip() {
        let key = IdentityKey::server("GameScore", "abc123").unwrap();
        assert_eq!(key.storage_key(), "obj:GameScore:abc123");
        assert_eq!(IdentityKey::from_storage_key("obj:GameScore:abc123").unwrap(), key);

        let local = IdentityKey::local("GameScore", "7f3e").unwrap();
        assert_eq!(local.storage_key(), "obj:GameScore:local_7f3e");
        let parsed = IdentityKey::from_storage_key(&local.storage_key()).unwrap();
        assert_eq!(parsed.id, ObjectId::Local("7f3e".into()));
    }

    #[test]
    fn rejects_bad_class_names() {
        assert!(matches!(
            IdentityKey::server("", "x"),
            Err(Error::InvalidClassName(_))
        ));
        assert!(matches!(
            IdentityKey::server("a:b", "x"),
            Err(Error::InvalidClassName(_))
        ));
    }

    #[test]
    fn rejects_foreign_keys() {
        assert!(IdentityKey::from_storage_key("outbox:00000000000000000001").is_err());
        assert!(IdentityKey::from_storage_key("obj:GameScore").is_err());
        assert!(IdentityKey::from_storage_key("obj:GameScore:").is_err());
    }

    #[test]
    fn class_prefix_matches_keys() {
        let key = IdentityKey::server("Post", "p1").unwrap();
        assert!(key.storage_key().starts_with(&IdentityKey::class_prefix("Post")));
        assert!(!key.storage_key().starts_with(&IdentityKey::class_prefix("Pos")));
    }
}
