//! Background job runner

pub mod local;
pub mod queue;

pub use local::LocalJobQueue;
pub use queue::{JobFuture, JobQueue, JobRecord, JobStatus};
