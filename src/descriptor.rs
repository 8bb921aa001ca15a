//! Configuration identity and content snapshot types.

use md5::{Digest, Md5};

use crate::error::ClientError;

/// Group used when the caller does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Identifies one configuration entry: namespace, group, data id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigIdentity {
    namespace: String,
    group: String,
    data_id: String,
}

impl ConfigIdentity {
    /// Builds an identity in the default group.
    pub fn new(namespace: impl Into<String>, data_id: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_group(namespace, DEFAULT_GROUP, data_id)
    }

    pub fn with_group(
        namespace: impl Into<String>,
        group: impl Into<String>,
        data_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let namespace = namespace.into();
        let data_id = data_id.into();
        if namespace.is_empty() {
            return Err(ClientError::InvalidIdentity("namespace is empty".to_string()));
        }
        if data_id.is_empty() {
            return Err(ClientError::InvalidIdentity("data id is empty".to_string()));
        }
        let group = group.into();
        let group = if group.is_empty() { DEFAULT_GROUP.to_string() } else { group };
        Ok(Self { namespace, group, data_id })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn data_id(&self) -> &str {
        &self.data_id
    }

    /// Canonical registry key. Two identities are the same subscription if
    /// and only if their keys match.
    pub fn unique_key(&self) -> String {
        format!("{}@{}@{}", self.namespace, self.group, self.data_id)
    }
}

/// An identity plus the locally known content snapshot and its digest.
///
/// `hash` is the server-assigned digest of `content`; an absent or empty
/// hash means this descriptor has never been synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    identity: ConfigIdentity,
    content: Option<String>,
    hash: Option<String>,
}

impl ConfigDescriptor {
    pub fn new(identity: ConfigIdentity) -> Self {
        Self { identity, content: None, hash: None }
    }

    pub fn identity(&self) -> &ConfigIdentity {
        &self.identity
    }

    pub fn namespace(&self) -> &str {
        self.identity.namespace()
    }

    pub fn group(&self) -> &str {
        self.identity.group()
    }

    pub fn data_id(&self) -> &str {
        self.identity.data_id()
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Whether this snapshot has ever been synced with the server.
    pub fn is_synced(&self) -> bool {
        self.hash.as_deref().is_some_and(|h| !h.is_empty())
    }

    pub fn unique_key(&self) -> String {
        self.identity.unique_key()
    }

    /// Returns a copy carrying new content and its digest.
    pub fn with_content(&self, content: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            identity: self.identity.clone(),
            content: Some(content.into()),
            hash: Some(hash.into()),
        }
    }
}

impl From<ConfigIdentity> for ConfigDescriptor {
    fn from(identity: ConfigIdentity) -> Self {
        Self::new(identity)
    }
}

/// Lower-case hex MD5 of `content`, the digest format the wire protocol uses
/// for change detection.
pub fn md5_hex(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_namespace_and_data_id() {
        assert!(ConfigIdentity::new("", "app").is_err());
        assert!(ConfigIdentity::new("ns", "").is_err());
        let id = ConfigIdentity::new("ns", "app").unwrap();
        assert_eq!(id.group(), DEFAULT_GROUP);
    }

    #[test]
    fn empty_group_falls_back_to_default() {
        let id = ConfigIdentity::with_group("ns", "", "app").unwrap();
        assert_eq!(id.group(), DEFAULT_GROUP);
    }

    #[test]
    fn unique_key_is_canonical() {
        let a = ConfigIdentity::with_group("ns", "g", "app").unwrap();
        let b = ConfigIdentity::with_group("ns", "g", "app").unwrap();
        assert_eq!(a.unique_key(), b.unique_key());
        assert_eq!(a.unique_key(), "ns@g@app");
    }

    #[test]
    fn with_content_marks_descriptor_synced() {
        let d = ConfigDescriptor::new(ConfigIdentity::new("ns", "app").unwrap());
        assert!(!d.is_synced());
        let synced = d.with_content("hello", md5_hex("hello"));
        assert!(synced.is_synced());
        assert_eq!(synced.content(), Some("hello"));
        // the original descriptor is untouched
        assert!(!d.is_synced());
    }

    #[test]
    fn md5_hex_matches_known_digest() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("hello"), "5d41402abc4b2a76b9719d911017c592");
    }
}
