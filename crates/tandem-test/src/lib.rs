//! Test harnesses for the Tandem build pipeline.
//!
//! Provides `TestProject`, a throwaway project directory wired to a
//! scripted generator and a file registry, for end-to-end CLI tests.

pub mod project;

pub use project::{fixtures_dir, TestError, TestProject};
