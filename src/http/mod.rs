//! Outbound HTTP with retry
//!
//! This module provides:
//! - Backoff policy with exponential growth, jitter, and Retry-After precedence
//! - Resilient client that classifies responses into retryable and terminal outcomes

pub mod backoff;
pub mod client;

pub use backoff::{parse_retry_after, BackoffDecision, BackoffPolicy, DelaySource};
pub use client::{
    next_transition, CallState, HttpResponse, RequestAuth, RequestBody, ResilientClient,
    RetryableRequest, Transition,
};
