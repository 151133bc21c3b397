//! Ordered bring-up/tear-down of every resource the Reactor depends on
//! (§4.8): client array + free stack → self-pipe → TUN (open + bring
//! up) → listen socket → Reactor. Tear-down runs in exact reverse and
//! is idempotent, matching §9's replacement for the source's
//! process-global `g_state` pattern — here the self-pipe write end is
//! owned by the signal handler registration itself and the read end by
//! this controller, with no global anywhere.

use std::fs::File;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};

use slog::Logger;

use crate::auth::AuthAdapter;
use crate::client::ClientRecord;
use crate::config::Configuration;
use crate::error::StartupError;
use crate::provision::TunProvisioner;
use crate::reactor::{bind_listener, Reactor};
use crate::slot::FreeStack;
use crate::tun::TunDevice;

const SHUTDOWN_SIGNALS: [libc::c_int; 4] = [libc::SIGINT, libc::SIGHUP, libc::SIGTERM, libc::SIGQUIT];

/// Owns every process-wide resource for one server run. `bring_up`
/// constructs everything in dependency order; `run` hands control to
/// the Reactor; `Drop` tears down whatever was built, in reverse, even
/// if `run` was never called or returned early.
pub struct Lifecycle<A: AuthAdapter, P: TunProvisioner> {
    self_pipe_read: RawFd,
    tun_dev_name: Option<String>,
    provisioner: P,
    reactor: Option<Reactor<A, TunDevice>>,
    log: Logger,
}

impl<A: AuthAdapter, P: TunProvisioner> Lifecycle<A, P> {
    /// Brings up the client array, self-pipe, TUN device (opened and
    /// provisioned), and listen socket, then builds the Reactor. Any
    /// failure partway through is reported as a `StartupError`; nothing
    /// built before the failing step is leaked because it is dropped as
    /// part of returning `Err` (the self-pipe and TUN device are only
    /// wrapped into `Self` once bring-up fully succeeds, so a partial
    /// failure here cleans up its own locals via ordinary `Drop`).
    pub fn bring_up(cfg: &Configuration, auth: A, provisioner: P, log: Logger) -> Result<Self, StartupError> {
        cfg.validate().map_err(|e| StartupError::Provision {
            dev: cfg.iface.dev.clone(),
            reason: e.to_string(),
        })?;

        if cfg.system.thread > 1 {
            return Err(StartupError::MultiReactorUnsupported(cfg.system.thread));
        }

        // §4.8 bring-up order, step one: the client array + free stack,
        // before the self-pipe/TUN/listener that follow.
        let clients: Vec<ClientRecord> = (0..cfg.socket.max_conn).map(ClientRecord::new).collect();
        let free = FreeStack::new(cfg.socket.max_conn);

        let self_pipe_read = open_self_pipe().map_err(StartupError::SelfPipe)?;

        let tun = TunDevice::open(&cfg.iface.dev)?;
        let tun_dev_name = tun.dev_name().to_string();
        provisioner
            .bring_up(&tun_dev_name, &cfg.iface)
            .map_err(|reason| StartupError::Provision {
                dev: tun_dev_name.clone(),
                reason,
            })?;

        let addr = format!("{}:{}", cfg.socket.bind_addr, cfg.socket.bind_port)
            .parse()
            .map_err(|_| StartupError::Provision {
                dev: tun_dev_name.clone(),
                reason: format!("invalid bind address {}:{}", cfg.socket.bind_addr, cfg.socket.bind_port),
            })?;
        let listener = bind_listener(addr, cfg.socket.backlog)?;

        let reactor = Reactor::new(listener, tun, self_pipe_read, clients, free, auth, log.clone())?;

        slog::info!(log, "lifecycle bring-up complete"; "dev" => %tun_dev_name, "bind" => %addr);

        Ok(Lifecycle {
            self_pipe_read,
            tun_dev_name: Some(tun_dev_name),
            provisioner,
            reactor: Some(reactor),
            log,
        })
    }

    /// Runs the Reactor to completion (until a shutdown signal is
    /// observed), then tears down in reverse bring-up order.
    pub fn run(&mut self) -> io::Result<()> {
        let result = match &mut self.reactor {
            Some(reactor) => reactor.run(),
            None => Ok(()),
        };
        self.shutdown();
        result
    }

    /// Idempotent: safe to call more than once (e.g. once explicitly
    /// from `run` and again from `Drop`).
    pub fn shutdown(&mut self) {
        // Un-provision while the Reactor (and the TunDevice fd it owns)
        // is still alive: a non-persistent IFF_TUN device disappears the
        // instant its last fd closes, so `bring_down` must run first or
        // it finds nothing left to tear down (§4.8 exact-reverse order).
        if let Some(dev) = self.tun_dev_name.take() {
            if let Err(reason) = self.provisioner.bring_down(&dev) {
                slog::warn!(self.log, "failed to bring down interface"; "dev" => %dev, "reason" => %reason);
            }
        }

        self.reactor = None;

        if self.self_pipe_read >= 0 {
            // SAFETY: `self_pipe_read` was opened by `open_self_pipe` and
            // is not otherwise closed; this runs at most meaningfully
            // once per process since `self_pipe_read` is set to -1 below.
            unsafe {
                libc::close(self.self_pipe_read);
            }
            self.self_pipe_read = -1;
        }
    }
}

impl<A: AuthAdapter, P: TunProvisioner> Drop for Lifecycle<A, P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens a non-blocking self-pipe and registers its write end against
/// every shutdown signal via `signal_hook::low_level::pipe`, so a
/// signal handler does nothing but write one byte — the Reactor
/// observes the read end becoming readable within one poll timeout.
fn open_self_pipe() -> io::Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid, writable 2-element array as required by `pipe2`.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let read_fd = fds[0];
    let write_fd = fds[1];
    // SAFETY: `write_fd` was just returned by a successful `pipe2` and
    // is not owned anywhere else.
    let write_file = unsafe { File::from_raw_fd(write_fd) };

    for &sig in &SHUTDOWN_SIGNALS {
        let writer = write_file.try_clone()?;
        signal_hook::low_level::pipe::register(sig, writer)?;
    }
    // `write_file` itself drops here; each registered clone keeps its
    // own fd alive for the process lifetime via signal-hook's internal
    // registry, so this drop does not affect them.

    Ok(read_fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAllAuth, IfaceCfg};
    use crate::config::{IfaceConfig, SockType, SocketConfig, SystemConfig};
    use crate::provision::RecordingProvisioner;

    fn test_config() -> Configuration {
        Configuration {
            system: SystemConfig {
                config_path: None,
                data_dir: "/tmp".into(),
                verbose: 0,
                thread: 1,
            },
            socket: SocketConfig {
                sock_type: SockType::Tcp,
                bind_addr: "127.0.0.1".into(),
                bind_port: 0,
                max_conn: 4,
                backlog: 16,
                use_encrypt: false,
                ssl_cert: None,
                ssl_priv_key: None,
            },
            iface: IfaceConfig {
                dev: "teavpn2t".into(),
                mtu: 1500,
                ipv4: "10.8.0.1".into(),
                ipv4_netmask: "255.255.255.0".into(),
            },
        }
    }

    #[test]
    fn rejects_multi_reactor_configuration() {
        let mut cfg = test_config();
        cfg.system.thread = 4;
        let auth = AllowAllAuth {
            assignment: IfaceCfg {
                dev: "t".into(),
                ipv4: "10.0.0.1".into(),
                netmask: "255.255.255.0".into(),
                mtu: 1500,
            },
        };
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let result = Lifecycle::bring_up(&cfg, auth, RecordingProvisioner::default(), log);
        assert!(matches!(result, Err(StartupError::MultiReactorUnsupported(4))));
    }
}
