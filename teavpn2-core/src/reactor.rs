//! Single-reactor event loop (§4.7).
//!
//! Poll-set layout is a fixed mapping from `mio::Token` to role:
//! `Token(0)` = listener, `Token(1)` = TUN, `Token(2)` = self-pipe read
//! end, `Token(3 + i)` = client slot `i`. This gives O(1) token→slot
//! translation without a side table, the same "fixed layout" the
//! source's poll-descriptor array provided, expressed through mio's
//! registration API instead of a hand-rolled `poll(2)` array.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slog::Logger;
use socket2::{Domain, Socket, Type};

use crate::auth::AuthAdapter;
use crate::client::{ClientRecord, ConnState};
use crate::counters::ServerCounters;
use crate::error::StartupError;
use crate::packet::{decode_next, encode_server_packet, new_send_buf, DecodeOutcome, SendBuf, ServerPacketType};
use crate::slot::FreeStack;
use crate::state_machine::{apply, FrameSink, Transition};
use crate::tun::TunIo;

const TOK_LISTENER: Token = Token(0);
const TOK_TUN: Token = Token(1);
const TOK_SELF_PIPE: Token = Token(2);
const TOK_CLIENT_BASE: usize = 3;

fn client_token(slot_idx: u16) -> Token {
    Token(TOK_CLIENT_BASE + slot_idx as usize)
}

fn token_to_slot(token: Token) -> Option<u16> {
    token.0.checked_sub(TOK_CLIENT_BASE).map(|i| i as u16)
}

/// Binds a listen socket with `SO_REUSEADDR` and the requested backlog,
/// in non-blocking mode, ready to hand to `mio::net::TcpListener`.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, StartupError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(|source| StartupError::Bind { addr, source })?;
    socket.set_reuse_address(true).map_err(|source| StartupError::Bind { addr, source })?;
    socket.set_nonblocking(true).map_err(|source| StartupError::Bind { addr, source })?;
    socket.bind(&addr.into()).map_err(|source| StartupError::Bind { addr, source })?;
    socket.listen(backlog).map_err(|source| StartupError::Bind { addr, source })?;
    Ok(TcpListener::from_std(socket.into()))
}

/// One running reactor instance. Owns every client socket it has
/// accepted; nothing outlives a handler call with a borrow into this
/// struct's internals (§9, "mixed ownership of client records").
pub struct Reactor<A: AuthAdapter, T: TunIo> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    tun: T,
    self_pipe_read: RawFd,
    clients: Vec<ClientRecord>,
    streams: Vec<Option<TcpStream>>,
    free: FreeStack,
    auth: A,
    log: Logger,
    stop: bool,
    send_buf: Box<SendBuf>,
    tun_scratch: Vec<u8>,
    counters: ServerCounters,
}

impl<A: AuthAdapter, T: TunIo> Reactor<A, T> {
    /// `clients`/`free` are built by the caller (the Lifecycle
    /// Controller) before the self-pipe, TUN device, and listener per
    /// §4.8's bring-up order ("allocate client array + free stack" is
    /// step one); this constructor only wires them into the poll set
    /// rather than allocating them itself.
    pub fn new(
        listener: TcpListener,
        tun: T,
        self_pipe_read: RawFd,
        clients: Vec<ClientRecord>,
        free: FreeStack,
        auth: A,
        log: Logger,
    ) -> Result<Self, StartupError> {
        let poll = Poll::new().map_err(|source| StartupError::PollRegister {
            what: "poll instance",
            source,
        })?;

        let mut listener = listener;
        poll.registry()
            .register(&mut listener, TOK_LISTENER, Interest::READABLE)
            .map_err(|source| StartupError::PollRegister {
                what: "listener",
                source,
            })?;

        // Test doubles (`FakeTun`) have no backing fd; they are serviced
        // by a direct call to `poll_tun` instead of readiness events.
        if let Some(tun_fd) = tun.raw_fd() {
            poll.registry()
                .register(&mut SourceFd(&tun_fd), TOK_TUN, Interest::READABLE)
                .map_err(|source| StartupError::PollRegister { what: "tun", source })?;
        }

        poll.registry()
            .register(&mut SourceFd(&self_pipe_read), TOK_SELF_PIPE, Interest::READABLE)
            .map_err(|source| StartupError::PollRegister {
                what: "self-pipe",
                source,
            })?;

        let streams = (0..clients.len()).map(|_| None).collect();

        Ok(Reactor {
            poll,
            events: Events::with_capacity(1024),
            listener,
            tun,
            self_pipe_read,
            clients,
            streams,
            free,
            auth,
            log,
            stop: false,
            send_buf: new_send_buf(),
            tun_scratch: vec![0u8; crate::config::PAYLOAD_MAX],
            counters: ServerCounters::new(),
        })
    }

    /// Lifetime total of successful interface assignments and current
    /// count of authenticated clients (§5's `tr_assign`/`online_tr`).
    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    /// Runs the loop until a shutdown signal is observed. Each wakeup
    /// has a 5-second timeout so the loop periodically re-checks `stop`
    /// even on an otherwise idle poll set.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll.poll(&mut self.events, Some(Duration::from_secs(5)))?;

            if self.stop {
                return Ok(());
            }

            let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
            for token in tokens {
                match token {
                    TOK_LISTENER => self.accept_loop(),
                    TOK_TUN => self.handle_tun_readable(),
                    TOK_SELF_PIPE => {
                        drain_self_pipe(self.self_pipe_read);
                        slog::info!(self.log, "shutdown signal observed");
                        self.stop = true;
                    }
                    t => {
                        if let Some(slot_idx) = token_to_slot(t) {
                            self.handle_client_readable(slot_idx);
                        }
                    }
                }
            }

            if self.stop {
                return Ok(());
            }
        }
    }

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.handle_accept(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    slog::warn!(self.log, "accept failed"; "err" => %e);
                    break;
                }
            }
        }
    }

    fn handle_accept(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let slot_idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                slog::warn!(self.log, "slot pool exhausted, rejecting connection"; "peer" => %addr);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            slog::warn!(self.log, "failed to set TCP_NODELAY"; "peer" => %addr, "err" => %e);
        }

        let fd = stream.as_raw_fd();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, client_token(slot_idx), Interest::READABLE)
        {
            slog::warn!(self.log, "failed to register client socket"; "peer" => %addr, "err" => %e);
            self.free.push(slot_idx);
            return;
        }

        self.clients[slot_idx as usize].activate(fd, addr);
        self.streams[slot_idx as usize] = Some(stream);
        slog::info!(self.log, "client connected"; "slot" => slot_idx, "peer" => %addr);
    }

    fn handle_client_readable(&mut self, slot_idx: u16) {
        let idx = slot_idx as usize;
        let mut should_terminate = false;

        loop {
            if self.clients[idx].recv_fill as usize == self.clients[idx].recv_buf.len() {
                // Buffer is exactly full awaiting the rest of one maximal
                // frame; reading into an empty slice would spuriously read
                // back `Ok(0)`, which this loop otherwise treats as peer
                // close. Wait for the next readiness event instead.
                break;
            }

            let read_result = match &mut self.streams[idx] {
                Some(stream) => {
                    let client = &mut self.clients[idx];
                    let fill = client.recv_fill as usize;
                    stream.read(&mut client.recv_buf[fill..])
                }
                None => return,
            };

            match read_result {
                Ok(0) => {
                    should_terminate = true;
                    break;
                }
                Ok(n) => {
                    self.clients[idx].recv_fill += n as u16;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    slog::debug!(self.log, "client read error"; "slot" => slot_idx, "err" => %e);
                    should_terminate = true;
                    break;
                }
            }

            if self.drain_frames(slot_idx) {
                should_terminate = true;
                break;
            }
        }

        if should_terminate {
            self.terminate(slot_idx);
        }
    }

    /// Decodes and applies every fully-buffered frame for `slot_idx`.
    /// Returns `true` if the connection must be terminated.
    fn drain_frames(&mut self, slot_idx: u16) -> bool {
        let idx = slot_idx as usize;
        loop {
            let outcome = decode_next(&mut self.clients[idx]);
            match outcome {
                DecodeOutcome::NeedMore => return false,
                DecodeOutcome::Corrupt => {
                    if self.clients[idx].charge_error() {
                        return true;
                    }
                    return false;
                }
                DecodeOutcome::Frame(frame) => {
                    let Reactor {
                        streams, tun, send_buf, log, clients, auth, counters, ..
                    } = self;
                    let stream = match &mut streams[idx] {
                        Some(s) => s,
                        None => return true,
                    };
                    let mut sink = ReactorSink::<T> {
                        stream,
                        tun,
                        send_buf,
                        log: &*log,
                        slot_idx,
                        send_failed: false,
                    };
                    let was_authenticated = clients[idx].ct_state == ConnState::Authenticated;
                    let transition = apply(&mut clients[idx], &frame, &*auth, &mut sink);
                    let send_failed = sink.send_failed;

                    if !was_authenticated && clients[idx].ct_state == ConnState::Authenticated {
                        counters.record_assignment();
                    }

                    match transition {
                        Transition::Close => return true,
                        Transition::ErrorCharged | Transition::Continue => {
                            if send_failed && clients[idx].charge_error() {
                                return true;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Services one TUN-readable event: reads at most one datagram and
    /// broadcasts it. Called by `run` on poll readiness; exposed
    /// publicly so tests can drive the TUN plane directly against a
    /// `FakeTun`, which has no fd for poll to ever report ready.
    pub fn poll_tun(&mut self) {
        self.handle_tun_readable()
    }

    fn handle_tun_readable(&mut self) {
        let n = match self.tun.read_one(&mut self.tun_scratch) {
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(e) => {
                slog::error!(self.log, "fatal TUN read error"; "err" => %e);
                self.stop = true;
                return;
            }
        };

        let frame_len = encode_server_packet(ServerPacketType::Data, &self.tun_scratch[..n], &mut self.send_buf);
        let frame = self.send_buf[..frame_len].to_vec();

        for idx in 0..self.clients.len() {
            if !self.clients[idx].in_use || self.clients[idx].ct_state != ConnState::Authenticated {
                continue;
            }
            let should_charge = match &mut self.streams[idx] {
                Some(stream) => match stream.write(&frame) {
                    Ok(written) if written == frame.len() => false,
                    Ok(_) => true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                    Err(e) => {
                        slog::debug!(self.log, "broadcast write failed"; "slot" => idx, "err" => %e);
                        true
                    }
                },
                None => continue,
            };
            if should_charge && self.clients[idx].charge_error() {
                self.terminate(idx as u16);
            }
        }
    }

    /// Connection termination (§4.7): deregister from the poll set, let
    /// the stream's `Drop` close the fd, reset the slot, then return
    /// the index to the free stack.
    fn terminate(&mut self, slot_idx: u16) {
        let idx = slot_idx as usize;
        if let Some(mut stream) = self.streams[idx].take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        if self.clients[idx].ct_state == ConnState::Authenticated {
            self.counters.record_offline();
        }
        self.clients[idx].reset();
        self.free.push(slot_idx);
        slog::info!(self.log, "client disconnected"; "slot" => slot_idx);
    }
}

fn drain_self_pipe(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: `read_fd` is a valid, open, non-blocking pipe read end
        // owned by the Lifecycle Controller for the process's lifetime.
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

/// `FrameSink` wired to a real client socket and TUN handle. At most
/// one client reply and/or one TUN forward per call, per §4.4.
struct ReactorSink<'a, T: TunIo> {
    stream: &'a mut TcpStream,
    tun: &'a mut T,
    send_buf: &'a mut SendBuf,
    log: &'a Logger,
    slot_idx: u16,
    send_failed: bool,
}

impl<'a, T: TunIo> FrameSink for ReactorSink<'a, T> {
    fn send_to_client(&mut self, kind: ServerPacketType, payload: &[u8]) {
        let n = encode_server_packet(kind, payload, &mut *self.send_buf);
        match self.stream.write(&self.send_buf[..n]) {
            Ok(written) if written == n => {}
            Ok(_) => {
                slog::debug!(self.log, "short write to client"; "slot" => self.slot_idx);
                self.send_failed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.send_failed = true;
            }
            Err(e) => {
                slog::debug!(self.log, "client send failed"; "slot" => self.slot_idx, "err" => %e);
                self.send_failed = true;
            }
        }
    }

    fn forward_to_tun(&mut self, payload: &[u8]) {
        match self.tun.write_one(payload) {
            Ok(true) => {}
            Ok(false) => {
                slog::debug!(self.log, "tun write would block, dropping packet"; "slot" => self.slot_idx);
            }
            Err(e) => {
                slog::warn!(self.log, "tun write failed"; "slot" => self.slot_idx, "err" => %e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllAuth;
    use crate::packet::HEADER_LEN;
    use crate::tun::FakeTun;
    use byteorder::{BigEndian, ByteOrder};
    use std::net::TcpStream as StdTcpStream;

    fn self_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0, "pipe2 failed");
        (fds[0], fds[1])
    }

    /// Builds the client array + free stack the way `Lifecycle::bring_up`
    /// does, as the first step before the self-pipe/TUN/listener (§4.8).
    fn new_clients(max_conn: u16) -> (Vec<ClientRecord>, FreeStack) {
        let clients = (0..max_conn).map(ClientRecord::new).collect();
        let free = FreeStack::new(max_conn);
        (clients, free)
    }

    fn assigned_auth() -> AllowAllAuth {
        AllowAllAuth {
            assignment: crate::auth::IfaceCfg {
                dev: "teavpn2-srv".into(),
                ipv4: "10.8.8.2".into(),
                netmask: "255.255.255.0".into(),
                mtu: 1480,
            },
        }
    }

    fn encode_header(kind: u8, len: u16) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = kind;
        BigEndian::write_u16(&mut out[2..4], len);
        out
    }

    fn read_exact_frame(stream: &mut StdTcpStream, expect_payload_len: usize) -> (u8, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).expect("read header");
        let len = BigEndian::read_u16(&header[2..4]) as usize;
        assert_eq!(len, expect_payload_len, "unexpected payload length");
        let mut payload = vec![0u8; len];
        if len > 0 {
            stream.read_exact(&mut payload).expect("read payload");
        }
        (header[0], payload)
    }

    /// Drives whatever bytes are currently sitting in each client's socket
    /// buffer through the Reactor, the same readiness-driven path `run`
    /// takes, without needing a real `mio::Poll` wakeup.
    fn pump(reactor: &mut Reactor<AllowAllAuth, FakeTun>, max_conn: u16) {
        std::thread::sleep(Duration::from_millis(30));
        for idx in 0..max_conn {
            reactor.handle_client_readable(idx);
        }
    }

    fn authenticate(stream: &mut StdTcpStream, reactor: &mut Reactor<AllowAllAuth, FakeTun>, max_conn: u16) {
        stream.write_all(&encode_header(0, 0)).unwrap();
        pump(reactor, max_conn);
        let (kind, _) = read_exact_frame(stream, 9);
        assert_eq!(kind, 0, "expected BANNER");

        let mut auth_payload = vec![0u8; 128];
        auth_payload[..5].copy_from_slice(b"alice");
        stream.write_all(&encode_header(1, 128)).unwrap();
        stream.write_all(&auth_payload).unwrap();
        pump(reactor, max_conn);
        let (kind, _) = read_exact_frame(stream, 50);
        assert_eq!(kind, 1, "expected AUTH_OK");
    }

    /// Property 7 (broadcast discipline) / scenario S6: one TUN read must
    /// reach every authenticated slot exactly once and no other slot at
    /// all, driven entirely through `FakeTun` so no kernel TUN device is
    /// needed.
    #[test]
    fn tun_read_broadcasts_only_to_authenticated_clients() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        let tun = FakeTun::new();
        let (pipe_read, _pipe_write) = self_pipe();
        let log = slog::Logger::root(slog::Discard, slog::o!());

        let max_conn = 4;
        let (clients, free) = new_clients(max_conn);
        let mut reactor =
            Reactor::new(listener, tun, pipe_read, clients, free, assigned_auth(), log).expect("reactor");

        let mut a = StdTcpStream::connect(addr).expect("connect a");
        let mut b = StdTcpStream::connect(addr).expect("connect b");
        let mut c = StdTcpStream::connect(addr).expect("connect c");
        a.set_nodelay(true).ok();
        b.set_nodelay(true).ok();
        c.set_nodelay(true).ok();

        std::thread::sleep(Duration::from_millis(30));
        reactor.accept_loop();

        // a and b authenticate fully; c stops after connecting and is left
        // unauthenticated (still `New`/`Established`).
        authenticate(&mut a, &mut reactor, max_conn);
        authenticate(&mut b, &mut reactor, max_conn);

        let packet = vec![0xABu8; 64];
        reactor.tun.push_inbound(packet.clone());
        reactor.poll_tun();

        let (kind, payload) = read_exact_frame(&mut a, 64);
        assert_eq!(kind, ServerPacketType::Data as u8);
        assert_eq!(payload, packet);

        let (kind, payload) = read_exact_frame(&mut b, 64);
        assert_eq!(kind, ServerPacketType::Data as u8);
        assert_eq!(payload, packet);

        c.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 1];
        let err = c.read(&mut buf).expect_err("unauthenticated client must receive nothing");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert!(*reactor.tun.written.lock().unwrap() == Vec::<Vec<u8>>::new());
    }
}
