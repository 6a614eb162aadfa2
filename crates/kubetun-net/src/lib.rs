//! Local network plumbing for kubetun
//!
//! Covers the pieces of the connect flow that touch the local machine's
//! network state: TUN address allocation, SOCKS proxy registration, and
//! the hosts-file override for cluster service names.

pub mod hosts;
pub mod ipalloc;
pub mod proxy;

pub use hosts::{merge_host_tables, HostsFile};
pub use ipalloc::{allocate_tun_pair, AllocationRange, IpAllocError};
pub use proxy::{reset_proxy, set_env_proxy, set_global_proxy, ProxyConfig, ProxyError};
