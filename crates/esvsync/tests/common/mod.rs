//! Shared test utilities for esvsync integration tests.
//!
//! This module provides:
//! - `TestHarness` with a temp configuration repository, an in-memory
//!   database and a fully wired `EsvService`
//! - `FakeExecutor`, a scripted stand-in for external commands
//! - Builders for environments and variable files

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{git, FakeExecutor, InlineTasks, Outcome, TestHarness, TEST_KEY};
