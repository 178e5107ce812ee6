//! `comfybench` library crate.
//!
//! Server lifecycle, result persistence and the two batch orchestrators
//! (benchmark runs and performance-log collection). The binary
//! entrypoint lives in `main.rs`; modules are public for integration
//! testing.

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod workflows;
