//! Tool server connections: lifecycle, request multiplexing, health checks.

pub mod health;
pub mod manager;
pub mod session;

pub use health::HealthMonitor;
pub use manager::ConnectionManager;
pub use session::{PendingRequest, ServerSession};
