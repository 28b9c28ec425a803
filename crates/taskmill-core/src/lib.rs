pub mod error;
pub mod event;
pub mod task;

// Re-export common error type
pub use error::MillError;
pub use event::{Event, EventData, EventsWrapper};
pub use task::{Task, TaskStatus};
