//! Raw `libc` ancillary-data handling for RX/TX timestamps, following the
//! `recvmsg`/`cmsg`/`MSG_ERRQUEUE` idiom used elsewhere in this workspace for
//! kernel-timestamp ancillary data (generalized here from `SCM_TXTIME` to
//! `SO_TIMESTAMPING`/`SCM_TIMESTAMPING`).

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tokio::io::unix::AsyncFd;

use crate::codec::PtpTimestamp;
use crate::error::{Error, Result};

use super::TimestampMode;

// Constants not exposed by every `libc` target triple.
mod linux_consts {
    pub const SO_TIMESTAMPING: libc::c_int = 37;
    pub const SCM_TIMESTAMPING: libc::c_int = 37;

    pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
    pub const SOF_TIMESTAMPING_TX_SOFTWARE: u32 = 1 << 1;
    pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
    pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
    pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
    pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
    pub const SOF_TIMESTAMPING_OPT_CMSG: u32 = 1 << 10;
    pub const SOF_TIMESTAMPING_OPT_TSONLY: u32 = 1 << 11;

    pub const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;

    pub const HWTSTAMP_TX_ON: libc::c_int = 1;
    pub const HWTSTAMP_FILTER_ALL: libc::c_int = 1;
}

/// `struct scm_timestamping` as written into the cmsg by the kernel: three
/// back-to-back `timespec`s — software, deprecated legacy, hardware — of
/// which this server reads only index 0 (software) or 2 (hardware).
#[repr(C)]
#[derive(Clone, Copy)]
struct ScmTimestamping {
    ts: [libc::timespec; 3],
}

/// `struct hwtstamp_config`, the payload of `SIOCSHWTSTAMP`.
#[repr(C)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

/// A UDP socket with kernel or hardware timestamping enabled, integrated
/// with the tokio reactor through `AsyncFd` rather than blocking a worker
/// thread on every `recvmsg`/`sendmsg` call.
pub struct TimestampedSocket {
    fd: AsyncFd<std::net::UdpSocket>,
    mode: TimestampMode,
    attempts_txts: u32,
    timeout_txts: Duration,
}

impl TimestampedSocket {
    /// Wrap `socket`, enabling `SO_TIMESTAMPING` for `mode` and, for
    /// [`TimestampMode::Hardware`], issuing `SIOCSHWTSTAMP` on `interface`.
    pub fn new(
        socket: std::net::UdpSocket,
        interface: &str,
        mode: TimestampMode,
        attempts_txts: u32,
        timeout_txts: Duration,
    ) -> Result<Self> {
        if mode == TimestampMode::Hardware {
            enable_hw_timestamping(&socket, interface)?;
        }
        enable_so_timestamping(&socket, mode)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
            mode,
            attempts_txts,
            timeout_txts,
        })
    }

    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    pub fn as_udp_socket(&self) -> &std::net::UdpSocket {
        self.fd.get_ref()
    }

    /// Receive one datagram plus its RX timestamp.
    pub async fn recv_timestamped(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, PtpTimestamp)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| rx_timestamp(inner.get_ref(), buf)) {
                Ok(result) => return result.map_err(Error::Io),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send `buf` to `addr` and retrieve the kernel/NIC TX timestamp,
    /// retrying the `MSG_ERRQUEUE` poll up to `attempts_txts` times.
    pub async fn send_and_timestamp(&self, buf: &[u8], addr: SocketAddr) -> Result<PtpTimestamp> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_one(inner.get_ref(), buf, addr)) {
                Ok(result) => {
                    result.map_err(Error::Io)?;
                    break;
                }
                Err(_would_block) => continue,
            }
        }
        self.poll_tx_timestamp().await
    }

    async fn poll_tx_timestamp(&self) -> Result<PtpTimestamp> {
        for _ in 0..self.attempts_txts {
            let guard = match tokio::time::timeout(self.timeout_txts, self.fd.readable()).await {
                Ok(Ok(guard)) => guard,
                Ok(Err(err)) => return Err(Error::Io(err)),
                Err(_elapsed) => continue,
            };
            let mut guard = guard;
            match guard.try_io(|inner| recv_errqueue_timestamp(inner.get_ref())) {
                Ok(Ok(Some(ts))) => return Ok(ts),
                Ok(Ok(None)) => continue,
                Ok(Err(err)) => return Err(Error::Io(err)),
                Err(_would_block) => continue,
            }
        }
        tracing::warn!(
            mode = self.mode.as_str(),
            attempts = self.attempts_txts,
            "TX timestamp not observed within retry budget"
        );
        Err(Error::TxTimestampMissing)
    }
}

fn enable_so_timestamping(socket: &std::net::UdpSocket, mode: TimestampMode) -> Result<()> {
    use linux_consts::*;

    let flags = match mode {
        TimestampMode::Hardware => {
            SOF_TIMESTAMPING_TX_HARDWARE
                | SOF_TIMESTAMPING_RX_HARDWARE
                | SOF_TIMESTAMPING_RAW_HARDWARE
                | SOF_TIMESTAMPING_OPT_CMSG
                | SOF_TIMESTAMPING_OPT_TSONLY
        }
        TimestampMode::Software => {
            SOF_TIMESTAMPING_TX_SOFTWARE
                | SOF_TIMESTAMPING_RX_SOFTWARE
                | SOF_TIMESTAMPING_SOFTWARE
                | SOF_TIMESTAMPING_OPT_CMSG
                | SOF_TIMESTAMPING_OPT_TSONLY
        }
    };

    // SAFETY: `flags` is a valid, fully-initialized `u32` on the stack;
    // `setsockopt` only reads from it for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            SO_TIMESTAMPING,
            &flags as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn enable_hw_timestamping(socket: &std::net::UdpSocket, interface: &str) -> Result<()> {
    let mut ifr: libc::ifreq = unsafe { MaybeUninit::zeroed().assume_init() };
    if interface.len() >= ifr.ifr_name.len() {
        return Err(Error::InterfaceNotFound(interface.to_string()));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(interface.bytes()) {
        *dst = src as libc::c_char;
    }

    let hwcfg = HwtstampConfig {
        flags: 0,
        tx_type: linux_consts::HWTSTAMP_TX_ON,
        rx_filter: linux_consts::HWTSTAMP_FILTER_ALL,
    };
    ifr.ifr_ifru.ifru_data = &hwcfg as *const _ as *mut libc::c_char;

    // SAFETY: `ifr` has a valid, NUL-containing interface name and
    // `ifru_data` points at a live `HwtstampConfig` for the duration of the
    // ioctl call.
    let ret = unsafe {
        libc::ioctl(
            socket.as_raw_fd(),
            linux_consts::SIOCSHWTSTAMP as _,
            &mut ifr,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return Err(Error::TimestampUnsupported {
            mode: TimestampMode::Hardware,
            interface: interface.to_string(),
            reason: err.to_string(),
        });
    }
    Ok(())
}

fn timespec_to_ptp(ts: libc::timespec) -> PtpTimestamp {
    PtpTimestamp {
        seconds: ts.tv_sec.max(0) as u64,
        nanoseconds: ts.tv_nsec as u32,
    }
}

/// Extract the `SCM_TIMESTAMPING` cmsg from a just-completed `recvmsg`/`MSG_ERRQUEUE`
/// ancillary buffer, preferring the hardware slot (index 2) over software (index 0).
fn extract_timestamp(msg: &libc::msghdr) -> Option<PtpTimestamp> {
    // SAFETY: `msg` was populated by a successful `recvmsg` call whose
    // `msg_control`/`msg_controllen` describe the ancillary buffer walked here.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == linux_consts::SCM_TIMESTAMPING
            {
                let data = libc::CMSG_DATA(cmsg) as *const ScmTimestamping;
                let scm = std::ptr::read_unaligned(data);
                let hw = scm.ts[2];
                if hw.tv_sec != 0 || hw.tv_nsec != 0 {
                    return Some(timespec_to_ptp(hw));
                }
                let sw = scm.ts[0];
                if sw.tv_sec != 0 || sw.tv_nsec != 0 {
                    return Some(timespec_to_ptp(sw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

/// Receive one datagram on `socket`, returning its payload, source address,
/// and RX timestamp (falling back to "now" if the kernel didn't attach one,
/// which should not happen once `SO_TIMESTAMPING` is set). A `WouldBlock`
/// error is the normal "no datagram ready" signal `try_io` expects.
fn rx_timestamp(
    socket: &std::net::UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, PtpTimestamp)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; 256];

    // SAFETY: `msg` is zero-initialized then every pointer/length field used
    // by `recvmsg` is set below before the call.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `socket`'s fd is valid and owned by this process; `msg`'s
    // buffers outlive the call and are sized as declared above.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = sockaddr_storage_to_std(&storage)?;
    let ts = extract_timestamp(&msg)
        .unwrap_or_else(|| PtpTimestamp::from_system_time(std::time::SystemTime::now()));
    Ok((n as usize, addr, ts))
}

fn sockaddr_storage_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: `ss_family == AF_INET`, so reinterpreting as `sockaddr_in` is valid.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            // SAFETY: `ss_family == AF_INET6`, so reinterpreting as `sockaddr_in6` is valid.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {other}"),
        )),
    }
}

fn std_addr_to_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: `storage` is large enough to hold a `sockaddr_in`
            // (guaranteed by `sockaddr_storage`'s definition).
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: `storage` is large enough to hold a `sockaddr_in6`.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Send one datagram to `addr` via `sendmsg`.
fn send_one(socket: &std::net::UdpSocket, buf: &[u8], addr: SocketAddr) -> io::Result<()> {
    let (storage, socklen) = std_addr_to_storage(addr);
    let iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: `msg` is zero-initialized then every pointer/length field used
    // by `sendmsg` is set below before the call.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &storage as *const _ as *mut libc::c_void;
    msg.msg_namelen = socklen;
    msg.msg_iov = &iov as *const _ as *mut libc::iovec;
    msg.msg_iovlen = 1;

    // SAFETY: `socket`'s fd is valid and owned by this process; `msg`'s
    // buffers outlive the call.
    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drain one `MSG_ERRQUEUE` entry and return its `SCM_TIMESTAMPING` payload,
/// if any. `Ok(None)` means a non-timestamp error-queue entry was drained and
/// the caller should try again; `WouldBlock` means the queue is empty.
fn recv_errqueue_timestamp(socket: &std::net::UdpSocket) -> io::Result<Option<PtpTimestamp>> {
    let mut buf = [0u8; 256];
    let mut cmsg_buf = [0u8; 256];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: `msg` is zero-initialized then every field `recvmsg` reads is
    // set below before the call.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `socket`'s fd is valid; `msg`'s buffers are sized as declared above.
    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_ERRQUEUE) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(extract_timestamp(&msg))
}
