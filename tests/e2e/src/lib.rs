//! End-to-end test support for the engram engine
//!
//! Provides an isolated kernel factory over a temporary database, with the
//! deterministic embedder/validator stubs wired in, plus event fixtures.

pub mod fixtures;
pub mod harness;

pub use harness::TestKernel;
