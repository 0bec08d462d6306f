//! How admission results reach the response.

use serde::Serialize;
use thiserror::Error;

use crate::config::HeaderConfig;
use crate::ratelimit::Decision;

/// Status and body used for blacklisted requests.
pub const FORBIDDEN_STATUS: u16 = 403;
pub const FORBIDDEN_MESSAGE: &str = "Forbidden";

/// Status and body used when a failing store closes the gate.
pub const UNAVAILABLE_STATUS: u16 = 503;
pub const UNAVAILABLE_MESSAGE: &str = "Service Unavailable";

/// Header name/value pairs to attach to a response.
pub type Headers = Vec<(String, String)>;

/// The response a gate writes to.
pub trait ResponseSink {
    fn set_header(&mut self, name: &str, value: &str);
    fn set_status(&mut self, status: u16);
    fn set_body(&mut self, body: &str);
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The bucket had less than one token
    RateLimited,
    /// The store could not commit the check in time
    Contended,
    /// The blacklist matched
    Forbidden,
    /// The store failed and the gate fails closed
    StoreUnavailable,
}

/// A denied request, ready to be written out or raised as an error.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{status} {message}")]
pub struct Rejection {
    pub reason: DenialReason,
    pub status: u16,
    pub message: String,
    pub headers: Headers,
}

impl Rejection {
    pub fn forbidden() -> Self {
        Self {
            reason: DenialReason::Forbidden,
            status: FORBIDDEN_STATUS,
            message: FORBIDDEN_MESSAGE.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn store_unavailable() -> Self {
        Self {
            reason: DenialReason::StoreUnavailable,
            status: UNAVAILABLE_STATUS,
            message: UNAVAILABLE_MESSAGE.to_string(),
            headers: Vec::new(),
        }
    }
}

/// Build the rate limit headers for a decision.
///
/// Returns nothing when headers are disabled.
pub fn decision_headers(names: &HeaderConfig, decision: &Decision) -> Headers {
    if names.disabled {
        return Vec::new();
    }
    vec![
        (names.rate.clone(), decision.rate.to_string()),
        (names.tokens.clone(), decision.tokens.to_string()),
        (names.capacity.clone(), decision.capacity.to_string()),
    ]
}

/// Write headers into a sink.
pub fn write_headers(sink: &mut dyn ResponseSink, headers: &Headers) {
    for (name, value) in headers {
        sink.set_header(name, value);
    }
}
