//! Request attribution and allow/deny predicates.

use async_trait::async_trait;

/// Who a request is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Charge the bucket for this identity
    Key(String),
    /// Skip rate limiting for this request
    Bypass,
}

impl Identity {
    /// `None` and empty strings bypass limiting.
    pub fn from_option(identity: Option<String>) -> Self {
        match identity {
            Some(key) if !key.is_empty() => Identity::Key(key),
            _ => Identity::Bypass,
        }
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Identity::Key(key.to_string())
    }
}

impl From<String> for Identity {
    fn from(key: String) -> Self {
        Identity::Key(key)
    }
}

/// Extracts the [`Identity`] of a request.
pub trait IdentityResolver<R>: Send + Sync {
    fn resolve(&self, request: &R) -> Identity;
}

impl<R, F> IdentityResolver<R> for F
where
    F: Fn(&R) -> Identity + Send + Sync,
{
    fn resolve(&self, request: &R) -> Identity {
        self(request)
    }
}

/// A yes/no question about a request, used for whitelists and blacklists.
///
/// Plain closures `Fn(&R) -> bool` implement this; implement it directly
/// when the answer needs I/O.
#[async_trait]
pub trait RequestPredicate<R>: Send + Sync {
    async fn matches(&self, request: &R) -> bool;
}

#[async_trait]
impl<R, F> RequestPredicate<R> for F
where
    R: Sync,
    F: Fn(&R) -> bool + Send + Sync,
{
    async fn matches(&self, request: &R) -> bool {
        self(request)
    }
}
