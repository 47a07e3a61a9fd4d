// Lifecycle states for workers, plans, isolated tasks and plan steps.
//
// Each enum carries its own transition table; owners validate a write with
// `can_transition_to` before applying it.

pub mod states;

pub use states::{PlanStatus, StepStatus, TaskStatus, WorkerStatus};
