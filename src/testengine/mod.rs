//! Test step framework (C6) and step library (C7), test-case catalogue (C8),
//! and session coordinator (C9).

pub mod step;
pub mod steps;
pub mod catalogue;
pub mod coordinator;

pub use coordinator::TestSessionCoordinator;
