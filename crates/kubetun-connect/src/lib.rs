//! Connect orchestration for kubetun
//!
//! Owns the connect lifecycle: the process exclusivity lock, the ordered
//! setup steps (TUN allocation, proxy registration, hosts dump, shadow
//! provisioning, transport hand-off), the interrupt monitor, and the
//! single workspace cleanup routine.

pub mod config;
pub mod connect;
pub mod lifecycle;
pub mod lock;
pub mod state;

pub use config::{parse_labels, ConnectConfig};
pub use connect::{ConnectError, Connector};
pub use lifecycle::{CleanupLatch, InterruptEvent, LifecycleMonitor};
pub use lock::{LockError, PidLock};
pub use state::{RuntimeState, ShadowLease};
