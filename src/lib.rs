//! Formguard - Sliding Window Admission Control
//!
//! This crate throttles repeated actions, such as form submissions, per caller
//! identifier over a rolling time window. State lives in process memory or in a
//! shared Redis instance so that many server instances enforce one limit, and
//! a configured failure policy decides what happens when Redis cannot answer.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::FormGuardConfig;
pub use error::{FormGuardError, Result};
pub use ratelimit::{LimitDecision, RateLimitFacade};
