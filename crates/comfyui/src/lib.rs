//! HTTP client library for a ComfyUI-style node-graph server.
//!
//! Provides the typed REST wrapper, `/history` parsing, and the
//! uniform-outcome execution client the sweep orchestrators drive
//! through the [`client::ExecutionBackend`] trait.

pub mod api;
pub mod client;
pub mod history;
