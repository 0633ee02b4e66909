//! Axum-based HTTP daemon for capture and rendering adapters.
//!
//! Adapters post normalized caption tracks to `/v1/translate` and receive the
//! translated cues together with the `cached` flag. The remaining endpoints
//! expose provider validation, cost estimates, cache maintenance, health and
//! Prometheus metrics.
//!
//! # Components
//!
//! - `handlers`: one function per endpoint
//! - `middleware`: request id layers and per-route request metrics
//! - `routes`: router construction and shared [`AppState`]
//!
//! Author: kelexine (<https://github.com/kelexine>)

mod handlers;
mod middleware;
mod routes;

pub use handlers::{EstimateBody, HealthResponse, TranslateBody};
pub use routes::{create_router, AppState};
