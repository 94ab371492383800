//! Conversion tasks: state machine and in-memory registry.

pub mod manager;
pub mod state;

pub use manager::{DownloadTicket, JobTicket, Submission, TaskManager};
pub use state::{ConversionType, Task, TaskSnapshot, TaskStatus};
