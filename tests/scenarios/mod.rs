//! Scenario-based tests for jobflow

mod core_failure;
mod events;
mod feature_flags;
mod ordering;
mod persistence;
mod state_machine;
mod tenant_limits;
mod timeout;
mod write_queue;
