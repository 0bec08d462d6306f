//! Bucket key generation.

/// Separator between the namespace and the requester identity.
pub const KEY_SEPARATOR: char = ':';

/// A key that uniquely identifies one token bucket.
///
/// The key is the namespace and the requester identity joined by
/// [`KEY_SEPARATOR`], e.g. `limit:10.0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The namespace this bucket belongs to
    pub namespace: String,
    /// The requester identity
    pub identity: String,
}

impl BucketKey {
    /// Create a new bucket key from a namespace and identity.
    pub fn new(namespace: &str, identity: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Convert the bucket key to the string used by the stores.
    pub fn to_store_key(&self) -> String {
        format!("{}{}{}", self.namespace, KEY_SEPARATOR, self.identity)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.identity)
    }
}
