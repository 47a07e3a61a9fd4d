pub mod event;
pub mod routing;

// Re-export key types for convenience
pub use event::{Event, EventPriority, EventType, Payload};
pub use routing::{topic_matches, validate_pattern};
