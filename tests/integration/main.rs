//! Integration tests for the orchestration core.

mod cli;
mod parallel_execution;
mod resilience;
mod state_recovery;
