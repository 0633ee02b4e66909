//! Utility functions and helpers for cuebridge.
//!
//! This module provides cross-cutting concerns like structured logging,
//! token sanitization, and retry logic with backoff.
//!
//! # Submodules
//!
//! - `logging`: Tracing initialization with secret redaction.
//! - `retry`: Retry mechanisms that respect backend retry-after hints.
//!
//! Author: kelexine (<https://github.com/kelexine>)

pub mod logging;
pub mod retry;
