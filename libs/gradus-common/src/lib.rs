//! Shared contract between the Gradus administrative layer and the
//! execution engine fleet: wire types, Redis key semantics, and engine
//! configuration.

pub mod config;
pub mod redis;
pub mod types;
