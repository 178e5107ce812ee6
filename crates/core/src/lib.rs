//! Pure domain logic for the ComfyUI benchmark harness.
//!
//! Nothing in this crate touches the network, child processes or the
//! result file. The protocol and runner crates feed data in and act on
//! what comes back, so everything here can be tested in isolation.

pub mod models;
pub mod results;
pub mod tracking;
pub mod variants;
pub mod workflow;
