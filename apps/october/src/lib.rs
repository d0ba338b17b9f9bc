//! # October - site server library
//!
//! The HTTP front door and CLI around `october-core`, exposed as a library
//! so integration tests can drive the axum router directly.

pub mod api;
pub mod cli;
