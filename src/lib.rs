// cuebridge - caption translation through pluggable backends with a two-tier cache
// Author: kelexine (https://github.com/kelexine)

pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod server;
pub mod utils;

pub use error::{BridgeError, ErrorKind, Result};
