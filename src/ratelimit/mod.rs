//! Token bucket admission logic.

mod bucket;
mod key;
mod limiter;

pub use bucket::{admit, refill, Admission, BucketConfig, BucketState};
pub use key::{BucketKey, KEY_SEPARATOR};
pub use limiter::{Decision, Limiter, DEFAULT_NAMESPACE};
