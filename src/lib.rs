//! Tollgate - Token Bucket Admission Control
//!
//! This crate admits or rejects requests per requester identity using a
//! token bucket. Bucket state lives in a pluggable store: an in-process map
//! for a single instance, or a networked key/value service shared by many.
//! Every check is a single atomic update on the store, so concurrent requests
//! for the same identity never over-admit.

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;

pub use gate::{Gate, Identity, Verdict};
pub use ratelimit::{BucketConfig, Decision, Limiter};
pub use store::{BucketStore, MemoryStore, RemoteStore};
