//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection setup, HTTP API
//! wrappers, and the driver that feeds WebSocket frames into the
//! execution tracker from `comfybench-core`.

pub mod api;
pub mod client;
pub mod execution;
pub mod messages;
pub mod tracker;
