//! TUN virtual network interface plane (§4.6).
//!
//! `TunDevice` opens `/dev/net/tun` and issues `TUNSETIFF` via raw
//! `libc::ioctl` to bind it to a point-to-point L3 device (`IFF_TUN |
//! IFF_NO_PI`, no per-packet protocol-info header). There is no mature
//! safe wrapper in the dependency stack for this ioctl, so the unsafe
//! surface here is kept to the three syscalls (`open`, `ioctl`, and the
//! `read`/`write` pair) and nothing else.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::StartupError;

const IFNAMSIZ: usize = 16;
const TUN_DEV_PATH: &str = "/dev/net/tun";

// From <linux/if_tun.h>. IFF_TUN selects L3 (no ethernet framing);
// IFF_NO_PI omits the 4-byte protocol-info header TeaVPN2's wire
// framing does not expect.
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    // Padding to match the kernel's `struct ifreq` union size; unused here.
    _pad: [u8; 22],
}

/// The TUN plane boundary the Reactor drives: one non-blocking read of
/// a whole IP datagram, one best-effort write of a client-sourced
/// payload. Modeled as a trait — the same boundary pattern as
/// `AuthAdapter`/`TunProvisioner` — so the Reactor can be exercised
/// against an in-memory fake in tests; a kernel TUN device cannot be
/// opened without `CAP_NET_ADMIN`, which an ordinary test run doesn't have.
pub trait TunIo {
    /// `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` (§4.6's "empty read" case).
    fn read_one(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    /// `Ok(false)` on `EAGAIN`/`EWOULDBLOCK`.
    fn write_one(&self, packet: &[u8]) -> io::Result<bool>;
    /// The fd to register for readability, if this implementation is
    /// backed by one. `None` for in-memory test doubles, which the
    /// Reactor then services by direct call instead of poll readiness.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// An open, bound TUN device. `read_one`/`write_one` are non-blocking;
/// the caller is expected to have registered the fd for readiness with
/// the Reactor's poll set before calling either.
pub struct TunDevice {
    fd: OwnedFd,
    dev_name: String,
}

impl TunDevice {
    /// Opens `/dev/net/tun` and binds it to `requested_name` (empty
    /// string lets the kernel pick `tunN`). Returns the device as
    /// actually named by the kernel, which may differ from the request.
    pub fn open(requested_name: &str) -> Result<Self, StartupError> {
        if requested_name.len() >= IFNAMSIZ {
            return Err(StartupError::TunOpen {
                dev: requested_name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "device name too long"),
            });
        }

        let path = CString::new(TUN_DEV_PATH).expect("static path has no NUL bytes");
        // SAFETY: `path` is a valid NUL-terminated C string; `open` is
        // called with a plain read-write flag and no varargs mode bits.
        let raw_fd: RawFd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if raw_fd < 0 {
            return Err(StartupError::TunOpen {
                dev: requested_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: `raw_fd` was just returned by a successful `open` and
        // is not owned anywhere else yet.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        let mut req = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, src) in req.ifr_name.iter_mut().zip(requested_name.bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: `fd` is a valid, open file descriptor; `req` is a
        // correctly laid out `ifreq` the kernel will read from and
        // write the assigned name back into.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &mut req as *mut IfReq) };
        if rc < 0 {
            return Err(StartupError::TunOpen {
                dev: requested_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let dev_name = read_ifr_name(&req.ifr_name);
        Ok(TunDevice { fd, dev_name })
    }

    pub fn dev_name(&self) -> &str {
        &self.dev_name
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl TunIo for TunDevice {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    /// Reads one packet into `buf`. `Ok(None)` on `EAGAIN`/`EWOULDBLOCK`
    /// (§4.6's "empty read" case, not an error).
    fn read_one(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        // SAFETY: `buf` is a valid, writable slice for its full length;
        // the fd is owned by `self` and open for the duration of the call.
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some(n as usize))
    }

    /// Writes one packet. `Ok(false)` on `EAGAIN`/`EWOULDBLOCK` (the
    /// caller should retry once the fd is writable again).
    fn write_one(&self, packet: &[u8]) -> io::Result<bool> {
        // SAFETY: `packet` is a valid, readable slice for its full length;
        // the fd is owned by `self` and open for the duration of the call.
        let n = unsafe { libc::write(self.fd.as_raw_fd(), packet.as_ptr().cast(), packet.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(false),
                _ => Err(err),
            };
        }
        Ok(true)
    }
}

fn read_ifr_name(raw: &[libc::c_char; IFNAMSIZ]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// An in-memory `TunIo` double: `write_one` appends to `written`, and a
/// preloaded queue of packets is handed out one at a time by
/// `read_one`, empty meaning `WouldBlock`. Lets the Reactor's broadcast
/// and forward paths be exercised without a kernel TUN device.
#[cfg(test)]
pub struct FakeTun {
    pending_reads: std::sync::Mutex<std::collections::VecDeque<Vec<u8>>>,
    pub written: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[cfg(test)]
impl FakeTun {
    pub fn new() -> Self {
        FakeTun {
            pending_reads: std::sync::Mutex::new(std::collections::VecDeque::new()),
            written: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queues a packet for the next `read_one` to return.
    pub fn push_inbound(&self, packet: Vec<u8>) {
        self.pending_reads.lock().unwrap().push_back(packet);
    }
}

#[cfg(test)]
impl Default for FakeTun {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl TunIo for FakeTun {
    fn read_one(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.pending_reads.lock().unwrap().pop_front() {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    fn write_one(&self, packet: &[u8]) -> io::Result<bool> {
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(true)
    }
}
