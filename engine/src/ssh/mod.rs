//! SSH session management

pub mod client;
pub mod command;
pub mod manager;
pub mod mock;
pub mod session;
pub mod target;

pub use command::{CommandResult, StreamEvent};
pub use manager::{ManagedSession, SessionManager, SshOptions};
pub use session::{Connector, RemoteSession, RemoteStream};
pub use target::Target;
