//! Live log streaming from managed hosts

pub mod buffer;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod relay;
pub mod source;

pub use buffer::{Backlog, Delivery, LineBuffer};
pub use registry::StreamRegistry;
pub use relay::{Relay, RelayHandle, RelayOptions};
pub use source::LogSource;
