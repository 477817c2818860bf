//! Mesh filesystem test and validation infrastructure.
//!
//! Provides an in-process test bed wiring a coordinator to the in-memory
//! collaborators, plus stress scenarios exercising concurrent operation
//! dispatch, writer draining, and shutdown behavior.

pub mod concurrency_tests;
pub mod harness;

pub use harness::TestBed;
