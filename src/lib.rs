//! Bulwark - Request Admission Service
//!
//! This crate puts fixed-window rate limiting in front of an HTTP
//! application. Requests pass through an explicit pipeline: a global limiter,
//! session loading, and for login submissions validation, a stricter login
//! limiter and credential checks. Counters live in a pluggable store, either
//! in process or in Redis.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod ratelimit;
pub mod session;
