//! Client identity: `ClockIdentity`, `PortIdentity`.

use zerocopy::byteorder::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// EUI-64 clock identity, unique per server process.
///
/// Derived from the server's outgoing interface MAC address the same way
/// IEEE 1588 derives a clock identity from an EUI-48: split the MAC at the
/// middle, insert `FF:FE`, and flip the universal/local bit (bit 1 of the
/// first octet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockIdentity(pub u64);

impl ClockIdentity {
    /// Derive an EUI-64 clock identity from a 6-byte MAC address.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut eui64 = [0u8; 8];
        eui64[0] = mac[0] ^ 0x02;
        eui64[1] = mac[1];
        eui64[2] = mac[2];
        eui64[3] = 0xff;
        eui64[4] = 0xfe;
        eui64[5] = mac[3];
        eui64[6] = mac[4];
        eui64[7] = mac[5];
        Self(u64::from_be_bytes(eui64))
    }

    /// Raw 64-bit value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Look up `interface`'s link-layer (MAC) address via `getifaddrs`, the same
/// walk-the-linked-list idiom this workspace uses to resolve an interface's
/// IPv4 address, generalized here to an `AF_PACKET`/`sockaddr_ll` entry.
pub fn interface_mac(interface: &str) -> Result<[u8; 6]> {
    use std::ffi::CStr;
    use std::ptr::null_mut;

    // SAFETY: `addrs` starts null and is only ever written by `getifaddrs`;
    // every `ifa` pointer dereferenced below is non-null per `ifa_next`'s
    // contract, and `freeifaddrs` runs on every exit path.
    unsafe {
        let mut addrs: *mut libc::ifaddrs = null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let mut current = addrs;
        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                if name == interface && (*ifa.ifa_addr).sa_family as i32 == libc::AF_PACKET {
                    let sll = &*(ifa.ifa_addr as *const libc::sockaddr_ll);
                    if sll.sll_halen == 6 {
                        let mut mac = [0u8; 6];
                        mac.copy_from_slice(&sll.sll_addr[..6]);
                        libc::freeifaddrs(addrs);
                        return Ok(mac);
                    }
                }
            }
            current = ifa.ifa_next;
        }
        libc::freeifaddrs(addrs);
    }
    Err(Error::InterfaceNotFound(interface.to_string()))
}

impl std::fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// (ClockIdentity, PortNumber) pair; equality defines client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    pub fn new(clock_identity: ClockIdentity, port_number: u16) -> Self {
        Self {
            clock_identity,
            port_number,
        }
    }
}

/// On-wire layout of a `PortIdentity`: 8-byte clock identity + 2-byte port number, big-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WirePortIdentity {
    clock_identity: zerocopy::byteorder::big_endian::U64,
    port_number: U16,
}

impl WirePortIdentity {
    pub const SIZE: usize = 10;

    pub fn from_identity(pi: PortIdentity) -> Self {
        Self {
            clock_identity: pi.clock_identity.as_u64().into(),
            port_number: pi.port_number.into(),
        }
    }

    pub fn to_identity(self) -> PortIdentity {
        PortIdentity {
            clock_identity: ClockIdentity(self.clock_identity.get()),
            port_number: self.port_number.get(),
        }
    }
}
