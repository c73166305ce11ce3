//! Sub-agent parallel fan-out: bounded-concurrency execution of a
//! `parallel_foreach` across independent child workflow instances.

mod coordinator;

pub use coordinator::{EchoDriver, SubAgentCoordinator, SubAgentDriver, SubAgentOutcome};
