pub mod adapter;
pub mod classify;
pub mod functions;
pub mod protocol;
pub mod transport;

pub use adapter::{AdapterState, ToolConnectionAdapter};
pub use transport::TransportConfig;
