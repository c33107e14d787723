pub mod execution;
pub mod tool_server;
pub mod workflow;

pub use execution::*;
pub use tool_server::*;
pub use workflow::*;
