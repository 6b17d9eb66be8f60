pub mod engine;
pub mod host;
pub mod middleware;
pub mod report;
pub mod status;

pub use engine::{ProbeEngine, ProbeOptions, VerifyRequest};
pub use host::HostFacts;
pub use middleware::MiddlewareKind;
pub use report::VerificationReport;
pub use status::{MiddlewareStatus, ServiceState};
