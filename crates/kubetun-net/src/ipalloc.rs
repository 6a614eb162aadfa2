//! TUN address allocation over a CIDR block
//!
//! The TUN transport mode needs two addresses from the configured CIDR:
//! one for the local end of the virtual interface and one for the remote
//! end inside the cluster. Allocation is a contiguous draw over the
//! network's usable host addresses, with the network and broadcast
//! addresses reserved.

use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Networks wider than /8 are rejected rather than materializing a
/// multi-gigabyte allocation map.
const MIN_PREFIX_LEN: u8 = 8;

/// TUN address allocation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpAllocError {
    /// The CIDR string could not be parsed or is unusable for allocation
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// The range has no usable address left
    #[error("address range exhausted: {0}")]
    RangeExhausted(String),
}

/// Contiguous allocator over the usable host addresses of an IPv4 network.
///
/// Addresses are handed out in ascending order starting at the first host
/// address. An address stays unavailable until [`AllocationRange::release`]
/// is called for it.
///
/// The range is rebuilt from the CIDR string on every invocation and holds
/// no cross-process state: two independent processes allocating from the
/// same CIDR can draw the same addresses. Callers that share a CIDR across
/// machines accept that collision window.
pub struct AllocationRange {
    /// First usable host address (network address + 1)
    base: u32,
    /// One slot per usable host address, true once allocated
    allocated: Vec<bool>,
    cidr: String,
}

impl AllocationRange {
    /// Parse a CIDR string like "10.1.1.0/30" into an allocation range.
    pub fn parse(cidr: &str) -> Result<Self, IpAllocError> {
        let invalid = || IpAllocError::InvalidCidr(cidr.to_string());

        let (ip_str, prefix_str) = cidr.split_once('/').ok_or_else(invalid)?;
        let addr = Ipv4Addr::from_str(ip_str).map_err(|_| invalid())?;
        let prefix_len = prefix_str.parse::<u8>().map_err(|_| invalid())?;
        if prefix_len > 32 || prefix_len < MIN_PREFIX_LEN {
            return Err(invalid());
        }

        let mask = !0u32 << (32 - prefix_len);
        let network = u32::from(addr) & mask;
        // Network and broadcast addresses are reserved; /31 and /32 leave
        // nothing to allocate but are still valid ranges.
        let usable = (1u64 << (32 - prefix_len)).saturating_sub(2) as usize;

        Ok(Self {
            base: network.wrapping_add(1),
            allocated: vec![false; usable],
            cidr: cidr.to_string(),
        })
    }

    /// Number of addresses still available.
    pub fn free(&self) -> usize {
        self.allocated.iter().filter(|taken| !**taken).count()
    }

    /// Draw the lowest unallocated host address.
    pub fn allocate_next(&mut self) -> Result<Ipv4Addr, IpAllocError> {
        for (offset, taken) in self.allocated.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return Ok(Ipv4Addr::from(self.base + offset as u32));
            }
        }
        Err(IpAllocError::RangeExhausted(self.cidr.clone()))
    }

    /// Return an address to the range. Addresses outside the range are
    /// ignored.
    pub fn release(&mut self, ip: Ipv4Addr) {
        let value = u32::from(ip);
        if value >= self.base {
            if let Some(taken) = self.allocated.get_mut((value - self.base) as usize) {
                *taken = false;
            }
        }
    }
}

/// Draw the TUN address pair from `cidr`: the first address is the local
/// (source) end of the virtual interface, the second the remote
/// (destination) end.
pub fn allocate_tun_pair(cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr), IpAllocError> {
    let mut range = AllocationRange::parse(cidr)?;
    let source = range.allocate_next()?;
    let destination = range.allocate_next()?;
    Ok((source, destination))
}
