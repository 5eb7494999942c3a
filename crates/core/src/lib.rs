//! Core domain logic for axis sweeps against a node-graph image server.
//!
//! Everything here is synchronous and free of network I/O: prompt axes
//! and weighted choice, combination enumeration, the persisted
//! exploration state, typed workflow graphs with parameter injection,
//! filename templates, seed allocation and configuration loading.

pub mod axis;
pub mod choice;
pub mod combination;
pub mod config;
pub mod error;
pub mod exploration;
pub mod hashing;
pub mod naming;
pub mod seed;
pub mod types;
pub mod workflow;
