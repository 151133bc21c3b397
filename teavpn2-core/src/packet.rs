//! Wire framing for the client⇄server byte-stream protocol (§4.3, §6).
//!
//! Header is 4 bytes: `type: u8`, `pad: u8`, `length: u16` in network
//! byte order. `byteorder` supplies the big-endian read/write the same
//! way the reference crate uses it for its own wire format.
//!
//! A decoded frame owns a copy of its payload rather than borrowing out
//! of `ClientRecord::recv_buf`: the state machine needs to mutate the
//! same record (`err_count`, `ct_state`, …) while reading the payload,
//! and an owned copy is what keeps that a plain `&mut` without fighting
//! the borrow checker or resorting to unsafe aliasing — the fixed byte
//! buffer plus an accessor over it (§9) this way stays two separate
//! objects instead of one self-referential one.

use byteorder::{BigEndian, ByteOrder};

use crate::client::ClientRecord;
use crate::config::PAYLOAD_MAX;

pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPacketType {
    Hello = 0,
    Auth = 1,
    IfaceAck = 2,
    IfaceFail = 3,
    IfaceData = 4,
    ReqSync = 5,
    Close = 6,
    /// Any type byte outside `0..=6`. The codec stays total (§8 property
    /// 2) by passing these through rather than treating them as corrupt;
    /// the state machine's "other" column (§4.4) is what decides their fate.
    Other(u8),
}

impl ClientPacketType {
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => ClientPacketType::Hello,
            1 => ClientPacketType::Auth,
            2 => ClientPacketType::IfaceAck,
            3 => ClientPacketType::IfaceFail,
            4 => ClientPacketType::IfaceData,
            5 => ClientPacketType::ReqSync,
            6 => ClientPacketType::Close,
            other => ClientPacketType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ClientPacketType::Hello => 0,
            ClientPacketType::Auth => 1,
            ClientPacketType::IfaceAck => 2,
            ClientPacketType::IfaceFail => 3,
            ClientPacketType::IfaceData => 4,
            ClientPacketType::ReqSync => 5,
            ClientPacketType::Close => 6,
            ClientPacketType::Other(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPacketType {
    Banner = 0,
    AuthOk = 1,
    AuthReject = 2,
    Data = 3,
    Close = 4,
}

/// A fully decoded frame. Owns a fixed-size copy of its payload (stack,
/// not heap) so it can outlive a call that mutates the `ClientRecord`
/// it was decoded from.
#[derive(Debug)]
pub struct ClientFrame {
    pub kind: ClientPacketType,
    len: u16,
    buf: [u8; PAYLOAD_MAX],
}

impl ClientFrame {
    /// Builds a frame from an already-assembled payload. Used by tests
    /// and by any caller that synthesizes a frame outside of `decode_next`.
    pub fn new(kind: ClientPacketType, payload: &[u8]) -> Self {
        assert!(payload.len() <= PAYLOAD_MAX);
        let mut buf = [0u8; PAYLOAD_MAX];
        buf[..payload.len()].copy_from_slice(payload);
        ClientFrame {
            kind,
            len: payload.len() as u16,
            buf,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

/// Result of attempting to decode one frame out of `recv_buf[0..recv_fill]`.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A fully-formed frame was decoded and the tail compacted.
    Frame(ClientFrame),
    /// Not enough bytes buffered yet; state is unchanged.
    NeedMore,
    /// `length` exceeded `PAYLOAD_MAX`; `recv_fill` has been reset to 0
    /// and the caller must charge one error (§4.3, §8 property 4).
    Corrupt,
}

/// Attempts to decode one frame from `client.recv_buf[0..client.recv_fill]`.
///
/// Call repeatedly until it returns `NeedMore` to drain every frame
/// available in the buffer, per §4.3's decode loop.
pub fn decode_next(client: &mut ClientRecord) -> DecodeOutcome {
    let fill = client.recv_fill as usize;
    if fill < HEADER_LEN {
        return DecodeOutcome::NeedMore;
    }

    let length = BigEndian::read_u16(&client.recv_buf[2..4]) as usize;

    if length > PAYLOAD_MAX {
        client.recv_fill = 0;
        return DecodeOutcome::Corrupt;
    }

    let frame_len = HEADER_LEN + length;
    if frame_len > fill {
        return DecodeOutcome::NeedMore;
    }

    let kind = ClientPacketType::from_u8(client.recv_buf[0]);

    let mut payload = [0u8; PAYLOAD_MAX];
    payload[..length].copy_from_slice(&client.recv_buf[HEADER_LEN..frame_len]);

    if fill > frame_len {
        client.recv_buf.copy_within(frame_len..fill, 0);
    }
    client.recv_fill = (fill - frame_len) as u16;

    DecodeOutcome::Frame(ClientFrame {
        kind,
        len: length as u16,
        buf: payload,
    })
}

/// Encodes a server packet into `out`, returning the number of bytes
/// written (`4 + payload.len()`). `out` must have room for the whole
/// frame; the Reactor sizes its send buffer to `HEADER_LEN + PAYLOAD_MAX`.
pub fn encode_server_packet(kind: ServerPacketType, payload: &[u8], out: &mut [u8]) -> usize {
    assert!(payload.len() <= PAYLOAD_MAX);
    assert!(out.len() >= HEADER_LEN + payload.len());
    out[0] = kind as u8;
    out[1] = 0;
    BigEndian::write_u16(&mut out[2..4], payload.len() as u16);
    out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    HEADER_LEN + payload.len()
}

/// Fixed-size scratch buffer sized for one maximum server frame, used
/// by callers that need an owned buffer (e.g. the broadcast path).
pub type SendBuf = [u8; HEADER_LEN + PAYLOAD_MAX];

pub fn new_send_buf() -> Box<SendBuf> {
    Box::new([0u8; HEADER_LEN + PAYLOAD_MAX])
}
