//! MCP client plumbing: transport descriptors (C8) and the session adapter
//! that opens and owns them (C9).

pub mod session;
pub mod transport;

pub use session::McpSession;
pub use transport::{build_descriptor, DaemonLaunchOptions, McpTransportDescriptor, RemoteDescriptorArgs};
