//! Request admission in front of a handler.
//!
//! A [`Gate`] attributes a request to an identity, consults the blacklist and
//! whitelist, runs the [`Limiter`], and turns the outcome into headers, a
//! status and a body for whatever response type the caller uses.

mod identity;
mod response;

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::config::{DenialConfig, FailurePolicy, HeaderConfig, TollgateConfig};
use crate::ratelimit::{Decision, Limiter};

pub use identity::{Identity, IdentityResolver, RequestPredicate};
pub use response::{
    decision_headers, write_headers, DenialReason, Headers, Rejection, ResponseSink,
    FORBIDDEN_MESSAGE, FORBIDDEN_STATUS, UNAVAILABLE_MESSAGE, UNAVAILABLE_STATUS,
};

/// Outcome of running a request through a [`Gate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Not rate limited: bypass identity or whitelisted
    Bypassed,
    /// Let through. `decision` is `None` when a failing store was ignored.
    Admitted {
        decision: Option<Decision>,
        headers: Headers,
    },
    /// Turned away
    Denied(Rejection),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Verdict::Denied(_))
    }

    /// Convert a denial into an error, keeping the headers of a pass.
    pub fn into_result(self) -> Result<Headers, Rejection> {
        match self {
            Verdict::Bypassed => Ok(Vec::new()),
            Verdict::Admitted { headers, .. } => Ok(headers),
            Verdict::Denied(rejection) => Err(rejection),
        }
    }
}

/// Admission control for requests of type `R`.
pub struct Gate<R> {
    /// The token bucket limiter
    limiter: Arc<Limiter>,
    /// Maps a request to its identity
    resolver: Box<dyn IdentityResolver<R>>,
    /// Requests that skip limiting
    whitelist: Option<Box<dyn RequestPredicate<R>>>,
    /// Requests that are always refused
    blacklist: Option<Box<dyn RequestPredicate<R>>>,
    /// Header names
    headers: HeaderConfig,
    /// Status and body for rate limited requests
    denial: DenialConfig,
    /// Behaviour on store failure
    on_store_failure: FailurePolicy,
}

impl<R: Sync> Gate<R> {
    /// Create a gate with default headers, denial and failure policy.
    pub fn new<I>(limiter: Arc<Limiter>, resolver: I) -> Self
    where
        I: IdentityResolver<R> + 'static,
    {
        Self {
            limiter,
            resolver: Box::new(resolver),
            whitelist: None,
            blacklist: None,
            headers: HeaderConfig::default(),
            denial: DenialConfig::default(),
            on_store_failure: FailurePolicy::default(),
        }
    }

    /// Create a gate using the response settings of `config`.
    pub fn from_config<I>(limiter: Arc<Limiter>, resolver: I, config: &TollgateConfig) -> Self
    where
        I: IdentityResolver<R> + 'static,
    {
        Self::new(limiter, resolver)
            .with_headers(config.headers.clone())
            .with_denial(config.denial.clone())
            .with_failure_policy(config.on_store_failure)
    }

    pub fn with_whitelist<P>(mut self, predicate: P) -> Self
    where
        P: RequestPredicate<R> + 'static,
    {
        self.whitelist = Some(Box::new(predicate));
        self
    }

    pub fn with_blacklist<P>(mut self, predicate: P) -> Self
    where
        P: RequestPredicate<R> + 'static,
    {
        self.blacklist = Some(Box::new(predicate));
        self
    }

    pub fn with_headers(mut self, headers: HeaderConfig) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_denial(mut self, denial: DenialConfig) -> Self {
        self.denial = denial;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_store_failure = policy;
        self
    }

    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    /// Decide whether `request` may proceed.
    ///
    /// The blacklist wins over everything, including bypass identities and
    /// the whitelist. Bypassed and blacklisted requests never touch the store.
    #[instrument(skip_all)]
    pub async fn check(&self, request: &R) -> Verdict {
        if let Some(blacklist) = &self.blacklist {
            if blacklist.matches(request).await {
                debug!("Request blacklisted");
                return Verdict::Denied(Rejection::forbidden());
            }
        }

        let identity = match self.resolver.resolve(request) {
            Identity::Key(identity) => identity,
            Identity::Bypass => return Verdict::Bypassed,
        };

        if let Some(whitelist) = &self.whitelist {
            if whitelist.matches(request).await {
                debug!(identity = %identity, "Request whitelisted");
                return Verdict::Bypassed;
            }
        }

        match self.limiter.check(&identity).await {
            Ok(decision) => {
                if decision.admitted {
                    return Verdict::Admitted {
                        headers: decision_headers(&self.headers, &decision),
                        decision: Some(decision),
                    };
                }

                // A contended check never read the bucket, so it has no
                // token count to report
                let (reason, headers) = if decision.contended {
                    (DenialReason::Contended, Vec::new())
                } else {
                    (
                        DenialReason::RateLimited,
                        decision_headers(&self.headers, &decision),
                    )
                };
                Verdict::Denied(Rejection {
                    reason,
                    status: self.denial.status,
                    message: self.denial.message.clone(),
                    headers,
                })
            }
            Err(e) => match self.on_store_failure {
                FailurePolicy::FailOpen => {
                    warn!(identity = %identity, error = %e, "Store failed, admitting request");
                    Verdict::Admitted {
                        decision: None,
                        headers: Vec::new(),
                    }
                }
                FailurePolicy::FailClosed => {
                    warn!(identity = %identity, error = %e, "Store failed, denying request");
                    Verdict::Denied(Rejection::store_unavailable())
                }
            },
        }
    }

    /// Write a verdict to `sink`.
    ///
    /// Returns `Ok(true)` when the request should continue to the handler
    /// and `Ok(false)` when the denial has been written. With
    /// `raise_as_error` set, denials are also returned as `Err`.
    pub fn respond(&self, verdict: &Verdict, sink: &mut dyn ResponseSink) -> Result<bool, Rejection> {
        match verdict {
            Verdict::Bypassed => Ok(true),
            Verdict::Admitted { headers, .. } => {
                write_headers(sink, headers);
                Ok(true)
            }
            Verdict::Denied(rejection) => {
                write_headers(sink, &rejection.headers);
                sink.set_status(rejection.status);
                sink.set_body(&rejection.message);

                if self.denial.raise_as_error {
                    Err(rejection.clone())
                } else {
                    Ok(false)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::BucketConfig;
    use crate::store::fake::FakeKv;
    use crate::store::{MemoryStore, RemoteStore};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Request {
        ip: Option<String>,
        trusted: bool,
        banned: bool,
    }

    impl Request {
        fn with_ip(ip: &str) -> Self {
            Self {
                ip: Some(ip.to_string()),
                trusted: false,
                banned: false,
            }
        }
    }

    #[derive(Default)]
    struct Response {
        headers: HashMap<String, String>,
        status: Option<u16>,
        body: Option<String>,
    }

    impl ResponseSink for Response {
        fn set_header(&mut self, name: &str, value: &str) {
            self.headers.insert(name.to_string(), value.to_string());
        }

        fn set_status(&mut self, status: u16) {
            self.status = Some(status);
        }

        fn set_body(&mut self, body: &str) {
            self.body = Some(body.to_string());
        }
    }

    /// Blacklist backed by a lookup that would need I/O in real use.
    struct BannedList(Vec<String>);

    #[async_trait]
    impl RequestPredicate<Request> for BannedList {
        async fn matches(&self, request: &Request) -> bool {
            tokio::task::yield_now().await;
            request
                .ip
                .as_ref()
                .map(|ip| self.0.contains(ip))
                .unwrap_or(false)
        }
    }

    fn by_ip(request: &Request) -> Identity {
        Identity::from_option(request.ip.clone())
    }

    fn gate(capacity: f64) -> (Gate<Request>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let limiter = Limiter::new(BucketConfig::new(10.0, capacity).unwrap(), store.clone())
            .with_clock(Arc::new(ManualClock::new(0)));
        let gate = Gate::new(Arc::new(limiter), by_ip)
            .with_whitelist(|req: &Request| req.trusted)
            .with_blacklist(|req: &Request| req.banned);
        (gate, store)
    }

    #[tokio::test]
    async fn test_admitted_request_gets_headers() {
        let (gate, _store) = gate(100.0);

        let verdict = gate.check(&Request::with_ip("A")).await;

        let mut response = Response::default();
        assert!(gate.respond(&verdict, &mut response).unwrap());
        assert_eq!(response.headers["X-RateLimit-Tokens"], "99");
        assert_eq!(response.headers["X-RateLimit-Rate"], "10");
        assert_eq!(response.headers["X-RateLimit-Capacity"], "100");
        assert_eq!(response.status, None);
    }

    #[tokio::test]
    async fn test_rate_limited_request() {
        let (gate, _store) = gate(1.0);
        let request = Request::with_ip("A");

        assert!(gate.check(&request).await.is_allowed());
        let verdict = gate.check(&request).await;

        let mut response = Response::default();
        assert!(!gate.respond(&verdict, &mut response).unwrap());
        assert_eq!(response.status, Some(429));
        assert_eq!(response.body.as_deref(), Some("Rate limit exceeded."));
        assert_eq!(response.headers["X-RateLimit-Tokens"], "0");

        match verdict {
            Verdict::Denied(rejection) => assert_eq!(rejection.reason, DenialReason::RateLimited),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bypass_identity_skips_store() {
        let (gate, store) = gate(1.0);
        let request = Request {
            ip: None,
            trusted: false,
            banned: false,
        };

        for _ in 0..5 {
            assert_eq!(gate.check(&request).await, Verdict::Bypassed);
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_whitelist_skips_store() {
        let (gate, store) = gate(1.0);
        let request = Request {
            trusted: true,
            ..Request::with_ip("A")
        };

        for _ in 0..5 {
            assert_eq!(gate.check(&request).await, Verdict::Bypassed);
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_blacklist_wins_over_whitelist_and_full_bucket() {
        let (gate, store) = gate(100.0);
        let request = Request {
            ip: Some("A".to_string()),
            trusted: true,
            banned: true,
        };

        let verdict = gate.check(&request).await;

        assert_eq!(verdict, Verdict::Denied(Rejection::forbidden()));
        assert!(store.is_empty());

        let mut response = Response::default();
        assert!(!gate.respond(&verdict, &mut response).unwrap());
        assert_eq!(response.status, Some(403));
        assert_eq!(response.body.as_deref(), Some("Forbidden"));
        assert!(response.headers.is_empty());
    }

    #[tokio::test]
    async fn test_async_blacklist_predicate() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Limiter::new(BucketConfig::new(1.0, 1.0).unwrap(), store);
        let gate: Gate<Request> = Gate::new(Arc::new(limiter), by_ip)
            .with_blacklist(BannedList(vec!["10.6.6.6".to_string()]));

        assert!(!gate.check(&Request::with_ip("10.6.6.6")).await.is_allowed());
        assert!(gate.check(&Request::with_ip("10.0.0.1")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_raise_as_error() {
        let (gate, _store) = gate(1.0);
        let gate = gate.with_denial(DenialConfig {
            status: 503,
            message: "Slow down".to_string(),
            raise_as_error: true,
        });
        let request = Request::with_ip("A");

        gate.check(&request).await;
        let verdict = gate.check(&request).await;

        let mut response = Response::default();
        let rejection = gate.respond(&verdict, &mut response).unwrap_err();
        assert_eq!(rejection.status, 503);
        assert_eq!(rejection.message, "Slow down");
        assert_eq!(rejection.headers.len(), 3);
        assert_eq!(rejection.to_string(), "503 Slow down");
    }

    #[tokio::test]
    async fn test_custom_and_disabled_headers() {
        let (gate, _store) = gate(10.0);
        let gate = gate.with_headers(HeaderConfig {
            tokens: "X-Remaining".to_string(),
            ..HeaderConfig::default()
        });

        let headers = gate.check(&Request::with_ip("A")).await.into_result().unwrap();
        assert!(headers.contains(&("X-Remaining".to_string(), "9".to_string())));

        let gate = gate.with_headers(HeaderConfig {
            disabled: true,
            ..HeaderConfig::default()
        });
        let headers = gate.check(&Request::with_ip("A")).await.into_result().unwrap();
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_by_default() {
        let kv = FakeKv::new();
        kv.fail_calls(true);
        let limiter = Limiter::new(
            BucketConfig::new(10.0, 100.0).unwrap(),
            Arc::new(RemoteStore::new(kv)),
        );
        let gate: Gate<Request> = Gate::new(Arc::new(limiter), by_ip);

        let verdict = gate.check(&Request::with_ip("A")).await;

        assert_eq!(verdict, Verdict::Denied(Rejection::store_unavailable()));
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_open() {
        let kv = FakeKv::new();
        kv.fail_calls(true);
        let limiter = Limiter::new(
            BucketConfig::new(10.0, 100.0).unwrap(),
            Arc::new(RemoteStore::new(kv)),
        );
        let gate: Gate<Request> =
            Gate::new(Arc::new(limiter), by_ip).with_failure_policy(FailurePolicy::FailOpen);

        let verdict = gate.check(&Request::with_ip("A")).await;

        assert_eq!(
            verdict,
            Verdict::Admitted {
                decision: None,
                headers: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_contention_is_reported_as_rate_limited_status() {
        let kv = FakeKv::new();
        kv.reject_next_swaps(u32::MAX);
        let limiter = Limiter::new(
            BucketConfig::new(10.0, 100.0).unwrap(),
            Arc::new(RemoteStore::new(kv).with_max_attempts(2)),
        );
        let gate: Gate<Request> = Gate::new(Arc::new(limiter), by_ip);

        match gate.check(&Request::with_ip("A")).await {
            Verdict::Denied(rejection) => {
                assert_eq!(rejection.reason, DenialReason::Contended);
                assert_eq!(rejection.status, 429);
                assert!(rejection.headers.is_empty());
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }
}
