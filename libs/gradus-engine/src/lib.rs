//! Submission execution engine.
//!
//! Runs student submissions against instructor test cases inside
//! per-language sandboxes whose occupancy is coordinated across engine
//! processes through a shared store. The flow for one submission is
//! backend selection, sandbox admission, staging, compilation, one
//! execution per test and teardown, producing a [`TestResult`] per
//! test case with open tests reported before closed ones.
//!
//! [`TestResult`]: gradus_common::types::TestResult

pub mod admission;
pub mod backend;
pub mod diff;
pub mod encoding;
pub mod error;
pub mod pipeline;
pub mod sandbox;
pub mod store;


pub use error::EngineError;
pub use pipeline::{EngineContext, ExecutionPipeline, NoopSink, ResultSink};
