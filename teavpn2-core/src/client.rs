//! Per-connection state owned exclusively by the Reactor (§3, §4.2).

use std::net::SocketAddr;

use crate::config::PAYLOAD_MAX;
use crate::packet::HEADER_LEN;

/// Error budget ceiling. Reaching this forces a disconnect (§4.4, §8).
pub const MAX_ERR_C: u8 = 10;

/// `recv_buf` capacity: one header plus one maximum payload.
pub const RECV_BUF_CAP: usize = HEADER_LEN + PAYLOAD_MAX;

/// `username` capacity (§3): "fixed-capacity 255-byte text,
/// NUL-terminated". Distinct from the wire `AUTH` payload's 64-byte
/// username field (SPEC_FULL.md) — the record's field is sized for
/// display/logging, not by the protocol.
pub const MAX_USERNAME: usize = 255;

/// `src_ip` capacity (§3): "dotted-quad text (≤15 bytes + NUL)".
pub const MAX_SRC_IP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Established,
    Authenticated,
    Disconnected,
}

/// Writes `s` into `dst` truncated to fit, NUL-terminated, the rest of
/// `dst` zeroed. The same fixed-buffer-plus-accessor shape `packet.rs`
/// uses for `iface_cfg` fields (§9: no representation-punning, just an
/// inline byte array and an accessor over it).
fn write_fixed(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in &mut dst[n..] {
        *b = 0;
    }
}

/// Reads a NUL-terminated fixed buffer back out as a `&str`, lossy on
/// anything that isn't valid UTF-8 (the wire protocol never guarantees
/// that of arbitrary client-supplied bytes).
fn read_fixed(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("")
}

/// One entry in the fixed-size client array. Identity is `slot_idx`,
/// which is preserved across `reset` and always equals this record's
/// array index while `in_use`.
pub struct ClientRecord {
    pub in_use: bool,
    pub is_connected: bool,
    pub is_authenticated: bool,
    pub ct_state: ConnState,

    username: [u8; MAX_USERNAME],

    src_ip: [u8; MAX_SRC_IP],
    pub src_port: u16,
    pub src_addr: Option<SocketAddr>,

    /// Kernel handle; `-1` when the slot is free. Stored as `RawFd`-shaped
    /// `i32` rather than an `Option<OwnedFd>` because the Reactor keeps
    /// actual ownership of the `mio::net::TcpStream` in a side table keyed
    /// by the same slot index — this field only mirrors the spec's "-1
    /// sentinel" invariant for introspection/logging/tests.
    pub fd: i32,

    pub slot_idx: u16,

    pub err_count: u8,
    pub send_count: u32,
    pub recv_count: u32,

    pub recv_fill: u16,
    pub recv_buf: [u8; RECV_BUF_CAP],
}

impl ClientRecord {
    /// Builds a record in the free state for array position `slot_idx`.
    pub fn new(slot_idx: u16) -> Self {
        let mut record = ClientRecord {
            in_use: false,
            is_connected: false,
            is_authenticated: false,
            ct_state: ConnState::Disconnected,
            username: [0u8; MAX_USERNAME],
            src_ip: [0u8; MAX_SRC_IP],
            src_port: 0,
            src_addr: None,
            fd: -1,
            slot_idx,
            err_count: 0,
            send_count: 0,
            recv_count: 0,
            recv_fill: 0,
            recv_buf: [0u8; RECV_BUF_CAP],
        };
        write_fixed(&mut record.username, "_");
        record
    }

    pub fn username(&self) -> &str {
        read_fixed(&self.username)
    }

    pub fn set_username(&mut self, username: &str) {
        write_fixed(&mut self.username, username);
    }

    pub fn src_ip(&self) -> &str {
        read_fixed(&self.src_ip)
    }

    /// Re-initializes the slot for reuse. `slot_idx` is preserved (§4.2).
    pub fn reset(&mut self) {
        self.in_use = false;
        self.is_connected = false;
        self.is_authenticated = false;
        self.ct_state = ConnState::Disconnected;
        self.fd = -1;
        self.recv_fill = 0;
        self.send_count = 0;
        self.recv_count = 0;
        write_fixed(&mut self.username, "_");
        self.src_ip = [0u8; MAX_SRC_IP];
        self.src_port = 0;
        self.src_addr = None;
        self.err_count = 0;
    }

    /// Activates a slot that was just popped off the free stack for a
    /// freshly accepted connection.
    pub fn activate(&mut self, fd: i32, addr: SocketAddr) {
        debug_assert!(!self.in_use);
        self.in_use = true;
        self.is_connected = true;
        self.ct_state = ConnState::New;
        self.fd = fd;
        self.src_addr = Some(addr);
        write_fixed(&mut self.src_ip, &addr.ip().to_string());
        self.src_port = addr.port();
    }

    /// Charges one error against the budget. Returns `true` if the
    /// budget is now exceeded and the slot must be disconnected (§4.4, §8).
    #[must_use]
    pub fn charge_error(&mut self) -> bool {
        self.err_count = self.err_count.saturating_add(1);
        self.err_count > MAX_ERR_C
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_preserves_slot_idx() {
        let mut c = ClientRecord::new(7);
        c.activate(42, "127.0.0.1:9999".parse().unwrap());
        c.set_username("alice");
        c.err_count = 3;
        c.reset();
        assert_eq!(c.slot_idx, 7);
        assert!(!c.in_use);
        assert!(!c.is_connected);
        assert!(!c.is_authenticated);
        assert_eq!(c.ct_state, ConnState::Disconnected);
        assert_eq!(c.fd, -1);
        assert_eq!(c.recv_fill, 0);
        assert_eq!(c.username(), "_");
        assert_eq!(c.src_ip(), "");
        assert_eq!(c.err_count, 0);
    }

    #[test]
    fn error_budget_enforced_after_max_err_c() {
        let mut c = ClientRecord::new(0);
        c.activate(3, "127.0.0.1:1".parse().unwrap());
        let mut tripped = false;
        for _ in 0..MAX_ERR_C {
            tripped = c.charge_error();
        }
        assert!(!tripped, "budget should not trip exactly at the ceiling");
        assert!(c.charge_error(), "one more error must trip the budget");
    }

    #[test]
    fn activate_fills_src_ip_inline_buffer() {
        let mut c = ClientRecord::new(0);
        c.activate(9, "192.168.1.42:5555".parse().unwrap());
        assert_eq!(c.src_ip(), "192.168.1.42");
        assert_eq!(c.src_port, 5555);
    }

    #[test]
    fn username_longer_than_capacity_is_truncated_not_heap_allocated() {
        let mut c = ClientRecord::new(0);
        let long = "a".repeat(MAX_USERNAME + 50);
        c.set_username(&long);
        assert_eq!(c.username().len(), MAX_USERNAME - 1);
    }
}
