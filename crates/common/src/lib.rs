//! # Bridge Common Library
//!
//! Shared infrastructure code used by the bridge service and its tests.
//!
//! This crate provides:
//! - Crate-wide error type and `Result` alias
//! - Structured logging setup (`tracing`)

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{init_tracing, init_tracing_from_env, init_tracing_json};
