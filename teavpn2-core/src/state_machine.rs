//! Client connection state machine (§4.4).
//!
//! `apply` is the pure entry point: given a client's current record, one
//! decoded frame, the auth adapter, and a `FrameSink` to deposit the (at
//! most one) outbound reply frame and/or TUN forward into, it performs
//! exactly the transition table in §4.4 and returns what the Reactor
//! should do next. Keeping this free of any socket/poll concern is what
//! lets the whole table be exercised in tests without real I/O.

use byteorder::ByteOrder;

use crate::auth::{AuthAdapter, AuthOutcome};
use crate::client::{ClientRecord, ConnState};
use crate::packet::{ClientFrame, ClientPacketType, ServerPacketType};

/// Three version triples: current, minimum-compatible, maximum-compatible.
/// Hard-coded to `{0,0,1}` on all three fields per the source (§4.4, §9 —
/// the Open Question about compatibility negotiation semantics is left
/// unresolved upstream, so this implementation reproduces the constant
/// rather than inventing a negotiation scheme).
pub const BANNER_VERSION: [u8; 3] = [0, 0, 1];

/// What the caller (Reactor or test harness) should do with the
/// connection after processing one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Transition {
    /// Nothing special; the connection stays open.
    Continue,
    /// The error budget was charged but not yet exceeded.
    ErrorCharged,
    /// The connection must be closed and the slot recycled.
    Close,
}

/// Destination for bytes the state machine produces while handling one
/// frame: at most one server-reply frame to this client, and/or one
/// payload forwarded to the TUN plane.
pub trait FrameSink {
    fn send_to_client(&mut self, kind: ServerPacketType, payload: &[u8]);
    fn forward_to_tun(&mut self, payload: &[u8]);
}

/// Applies one decoded client frame to `client`, per the transition
/// table in §4.4. `auth` is consulted only on `AUTH` while `ESTABLISHED`.
pub fn apply<S: FrameSink>(
    client: &mut ClientRecord,
    frame: &ClientFrame,
    auth: &dyn AuthAdapter,
    sink: &mut S,
) -> Transition {
    client.recv_count = client.recv_count.saturating_add(1);

    match (client.ct_state, frame.kind) {
        (ConnState::Disconnected, _) => Transition::Close,

        (ConnState::New, ClientPacketType::Hello) => {
            send_banner(sink);
            client.ct_state = ConnState::Established;
            Transition::Continue
        }
        (ConnState::New, ClientPacketType::Close) => close(client),
        (ConnState::New, ClientPacketType::Auth) => close(client),
        (ConnState::New, ClientPacketType::IfaceData) => close(client),
        (ConnState::New, _) => forbidden_other(client, false),

        (ConnState::Established, ClientPacketType::Hello) => Transition::Continue,
        (ConnState::Established, ClientPacketType::Auth) => {
            handle_auth(client, frame.payload(), auth, sink)
        }
        (ConnState::Established, ClientPacketType::Close) => close(client),
        (ConnState::Established, ClientPacketType::IfaceData) => close(client),
        (ConnState::Established, _) => forbidden_other(client, false),

        (ConnState::Authenticated, ClientPacketType::Hello) => Transition::Continue,
        (ConnState::Authenticated, ClientPacketType::Auth) => Transition::Continue,
        (ConnState::Authenticated, ClientPacketType::IfaceData) => {
            sink.forward_to_tun(frame.payload());
            client.send_count = client.send_count.saturating_add(1);
            Transition::Continue
        }
        (ConnState::Authenticated, ClientPacketType::Close) => close(client),
        (ConnState::Authenticated, _) => forbidden_other(client, true),
    }
}

fn send_banner<S: FrameSink>(sink: &mut S) {
    let mut payload = [0u8; 9];
    payload[0..3].copy_from_slice(&BANNER_VERSION);
    payload[3..6].copy_from_slice(&BANNER_VERSION);
    payload[6..9].copy_from_slice(&BANNER_VERSION);
    sink.send_to_client(ServerPacketType::Banner, &payload);
}

/// Username/password fields in the wire `AUTH` payload are each a
/// fixed 64-byte, NUL-terminated slot (§4.4, §6).
const AUTH_FIELD_LEN: usize = 64;

fn handle_auth<S: FrameSink>(
    client: &mut ClientRecord,
    payload: &[u8],
    auth: &dyn AuthAdapter,
    sink: &mut S,
) -> Transition {
    if payload.len() != AUTH_FIELD_LEN * 2 {
        return charge_or_close(client);
    }
    let username = nul_terminated_str(&payload[0..AUTH_FIELD_LEN]);
    let password = nul_terminated_str(&payload[AUTH_FIELD_LEN..AUTH_FIELD_LEN * 2]);

    match auth.authenticate(username, password) {
        AuthOutcome::Assigned(cfg) => {
            client.set_username(username);
            client.is_authenticated = true;
            client.ct_state = ConnState::Authenticated;
            let reply = encode_iface_cfg(&cfg);
            sink.send_to_client(ServerPacketType::AuthOk, &reply);
            Transition::Continue
        }
        AuthOutcome::Rejected => {
            sink.send_to_client(ServerPacketType::AuthReject, &[]);
            client.ct_state = ConnState::Disconnected;
            Transition::Close
        }
    }
}

/// `iface_cfg` wire layout: `dev[16]`, `ipv4[16]`, `netmask[16]`, `mtu: u16`.
fn encode_iface_cfg(cfg: &crate::auth::IfaceCfg) -> [u8; 50] {
    let mut out = [0u8; 50];
    write_fixed_str(&mut out[0..16], &cfg.dev);
    write_fixed_str(&mut out[16..32], &cfg.ipv4);
    write_fixed_str(&mut out[32..48], &cfg.netmask);
    byteorder::LittleEndian::write_u16(&mut out[48..50], cfg.mtu);
    out
}

fn write_fixed_str(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    dst[n] = 0;
}

fn nul_terminated_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// A forbidden transition or send failure: charge the error budget, and
/// force `Disconnected` if the ceiling is exceeded (§4.4, §7, §8).
fn close(client: &mut ClientRecord) -> Transition {
    client.ct_state = ConnState::Disconnected;
    Transition::Close
}

fn charge_or_close(client: &mut ClientRecord) -> Transition {
    if client.charge_error() {
        client.ct_state = ConnState::Disconnected;
        Transition::Close
    } else {
        Transition::ErrorCharged
    }
}

/// The "other" column of the transition table (§4.4): ignore if the
/// client is already authenticated, otherwise close.
fn forbidden_other(client: &mut ClientRecord, is_authenticated: bool) -> Transition {
    if is_authenticated {
        Transition::Continue
    } else {
        close(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuth, IfaceCfg};
    use crate::client::ClientRecord;
    use crate::packet::decode_next;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct RecordingSink {
        client_frames: Vec<(ServerPacketType, Vec<u8>)>,
        tun_writes: Vec<Vec<u8>>,
    }

    impl FrameSink for RecordingSink {
        fn send_to_client(&mut self, kind: ServerPacketType, payload: &[u8]) {
            self.client_frames.push((kind, payload.to_vec()));
        }
        fn forward_to_tun(&mut self, payload: &[u8]) {
            self.tun_writes.push(payload.to_vec());
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn auth_payload(username: &str, password: &str) -> Vec<u8> {
        let mut buf = vec![0u8; AUTH_FIELD_LEN * 2];
        buf[..username.len()].copy_from_slice(username.as_bytes());
        buf[AUTH_FIELD_LEN..AUTH_FIELD_LEN + password.len()].copy_from_slice(password.as_bytes());
        buf
    }

    fn assigned_auth() -> AllowAllAuth {
        AllowAllAuth {
            assignment: IfaceCfg {
                dev: "teavpn2-srv".into(),
                ipv4: "10.8.8.2".into(),
                netmask: "255.255.255.0".into(),
                mtu: 1480,
            },
        }
    }

    struct RejectAuth;
    impl AuthAdapter for RejectAuth {
        fn authenticate(&self, _u: &str, _p: &str) -> AuthOutcome {
            AuthOutcome::Rejected
        }
    }

    // S1: happy path.
    #[test]
    fn hello_then_auth_then_iface_data() {
        let mut c = ClientRecord::new(0);
        c.activate(5, addr());
        let mut sink = RecordingSink::default();
        let auth = assigned_auth();

        let hello = ClientFrame::new(ClientPacketType::Hello, &[]);
        assert_eq!(apply(&mut c, &hello, &auth, &mut sink), Transition::Continue);
        assert_eq!(c.ct_state, ConnState::Established);
        assert_eq!(sink.client_frames.len(), 1);
        assert_eq!(sink.client_frames[0].0, ServerPacketType::Banner);
        assert_eq!(sink.client_frames[0].1, BANNER_VERSION.repeat(3));

        let payload = auth_payload("alice", "p");
        let auth_frame = ClientFrame::new(ClientPacketType::Auth, &payload);
        assert_eq!(
            apply(&mut c, &auth_frame, &auth, &mut sink),
            Transition::Continue
        );
        assert_eq!(c.ct_state, ConnState::Authenticated);
        assert_eq!(sink.client_frames[1].0, ServerPacketType::AuthOk);
        assert_eq!(sink.client_frames[1].1.len(), 50);

        let ip_header = vec![0x45u8; 20];
        let data_frame = ClientFrame::new(ClientPacketType::IfaceData, &ip_header);
        assert_eq!(
            apply(&mut c, &data_frame, &auth, &mut sink),
            Transition::Continue
        );
        assert_eq!(sink.tun_writes, vec![ip_header]);
    }

    // S2: auth rejection.
    #[test]
    fn rejected_auth_closes_connection() {
        let mut c = ClientRecord::new(0);
        c.activate(1, addr());
        c.ct_state = ConnState::Established;
        let mut sink = RecordingSink::default();
        let payload = auth_payload("mallory", "x");
        let frame = ClientFrame::new(ClientPacketType::Auth, &payload);
        assert_eq!(apply(&mut c, &frame, &RejectAuth, &mut sink), Transition::Close);
        assert_eq!(c.ct_state, ConnState::Disconnected);
        assert_eq!(sink.client_frames, vec![(ServerPacketType::AuthReject, vec![])]);
    }

    // S4: out-of-order protocol (AUTH without HELLO).
    #[test]
    fn auth_before_hello_closes_without_reply() {
        let mut c = ClientRecord::new(0);
        c.activate(2, addr());
        assert_eq!(c.ct_state, ConnState::New);
        let mut sink = RecordingSink::default();
        let payload = auth_payload("alice", "p");
        let frame = ClientFrame::new(ClientPacketType::Auth, &payload);
        assert_eq!(apply(&mut c, &frame, &assigned_auth(), &mut sink), Transition::Close);
        assert!(sink.client_frames.is_empty());
        assert!(sink.tun_writes.is_empty());
    }

    // S5: length corruption is handled by the codec; here we confirm the
    // state machine side of "error budget enforced" for protocol faults
    // it is responsible for (a malformed AUTH payload length).
    #[test]
    fn malformed_auth_payload_charges_error_budget() {
        let mut c = ClientRecord::new(0);
        c.activate(3, addr());
        c.ct_state = ConnState::Established;
        let mut sink = RecordingSink::default();
        let short_payload = vec![0u8; 10];
        let frame = ClientFrame::new(ClientPacketType::Auth, &short_payload);
        assert_eq!(
            apply(&mut c, &frame, &assigned_auth(), &mut sink),
            Transition::ErrorCharged
        );
        assert_eq!(c.err_count, 1);
        assert_eq!(c.ct_state, ConnState::Established);
    }

    #[test]
    fn authenticated_is_monotonic_and_idempotent() {
        let mut c = ClientRecord::new(0);
        c.activate(4, addr());
        c.ct_state = ConnState::Authenticated;
        c.is_authenticated = true;
        let mut sink = RecordingSink::default();
        let hello = ClientFrame::new(ClientPacketType::Hello, &[]);
        apply(&mut c, &hello, &assigned_auth(), &mut sink);
        assert_eq!(c.ct_state, ConnState::Authenticated);
        assert!(sink.client_frames.is_empty());

        let payload = auth_payload("alice", "p");
        let auth_frame = ClientFrame::new(ClientPacketType::Auth, &payload);
        apply(&mut c, &auth_frame, &assigned_auth(), &mut sink);
        assert_eq!(c.ct_state, ConnState::Authenticated);
        assert!(sink.client_frames.is_empty(), "AUTH while authenticated is a no-op");
    }

    #[test]
    fn unused_defined_types_fall_through_other_column() {
        // REQSYNC / IFACE_ACK / IFACE_FAIL are defined but unused (§9);
        // they must still route through the "other" column rather than
        // panicking or being special-cased.
        let mut c = ClientRecord::new(0);
        c.activate(6, addr());
        c.ct_state = ConnState::Authenticated;
        let mut sink = RecordingSink::default();
        let frame = ClientFrame::new(ClientPacketType::ReqSync, &[]);
        assert_eq!(apply(&mut c, &frame, &assigned_auth(), &mut sink), Transition::Continue);
    }

    // Decoding then applying, to exercise the seam between the codec and
    // the state machine the way the Reactor does.
    #[test]
    fn decode_then_apply_hello() {
        let mut c = ClientRecord::new(0);
        c.activate(0, addr());
        c.recv_buf[0..4].copy_from_slice(&[0, 0, 0, 0]);
        c.recv_fill = 4;
        let frame = match decode_next(&mut c) {
            crate::packet::DecodeOutcome::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        };
        let mut sink = RecordingSink::default();
        assert_eq!(
            apply(&mut c, &frame, &assigned_auth(), &mut sink),
            Transition::Continue
        );
    }
}
