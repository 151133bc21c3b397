//! TUN device provisioning via `ip`/`ifconfig` shell-outs (§4.8, §6, §9).
//!
//! The Lifecycle Controller asks a `TunProvisioner` to bring the newly
//! opened TUN device up with an address/netmask/MTU and to tear it back
//! down on shutdown. Only the two touch points the spec names are
//! implemented here — the actual shell command used to provision a
//! device is a distribution detail the core does not otherwise care
//! about, so it is kept behind this trait rather than hard-coded into
//! the Reactor or Lifecycle Controller.

use std::process::Command;

use crate::config::IfaceConfig;

/// Brings a TUN device's L3 configuration up or down. Implementations
/// are expected to shell out (`ip addr`, `ip link`); the trait exists
/// so tests can substitute a no-op or recording implementation.
pub trait TunProvisioner {
    fn bring_up(&self, dev: &str, cfg: &IfaceConfig) -> Result<(), String>;
    fn bring_down(&self, dev: &str) -> Result<(), String>;
}

/// Provisions via the `ip` command, the way modern Linux distributions
/// expect (`ip addr add ... dev ...`, `ip link set ... up`, `ip link
/// set ... mtu ...`).
pub struct IpCommandProvisioner;

impl TunProvisioner for IpCommandProvisioner {
    fn bring_up(&self, dev: &str, cfg: &IfaceConfig) -> Result<(), String> {
        run(&[
            "ip",
            "addr",
            "add",
            &format!("{}/{}", cfg.ipv4, netmask_to_prefix(&cfg.ipv4_netmask)),
            "dev",
            dev,
        ])?;
        run(&["ip", "link", "set", "dev", dev, "mtu", &cfg.mtu.to_string()])?;
        run(&["ip", "link", "set", "dev", dev, "up"])
    }

    fn bring_down(&self, dev: &str) -> Result<(), String> {
        run(&["ip", "link", "set", "dev", dev, "down"])
    }
}

fn run(argv: &[&str]) -> Result<(), String> {
    let status = Command::new(argv[0])
        .args(&argv[1..])
        .status()
        .map_err(|e| format!("failed to spawn `{}`: {e}", argv.join(" ")))?;
    if !status.success() {
        return Err(format!(
            "`{}` exited with {status}",
            argv.join(" ")
        ));
    }
    Ok(())
}

/// Converts a dotted-decimal netmask (e.g. `255.255.255.0`) to a CIDR
/// prefix length for `ip addr add`. Falls back to `/32` on anything
/// that doesn't parse as four octets, rather than failing provisioning
/// outright over a cosmetic detail.
fn netmask_to_prefix(netmask: &str) -> u8 {
    let octets: Option<Vec<u8>> = netmask.split('.').map(|p| p.parse().ok()).collect();
    match octets {
        Some(octets) if octets.len() == 4 => {
            let mut bits: u32 = 0;
            for o in octets {
                bits = (bits << 8) | o as u32;
            }
            bits.count_ones() as u8
        }
        _ => 32,
    }
}

/// A provisioner that records calls instead of touching the system,
/// for tests that exercise the Lifecycle Controller's ordering without
/// root privileges or a real TUN device.
#[cfg(test)]
pub struct RecordingProvisioner {
    pub up_calls: std::sync::Mutex<Vec<String>>,
    pub down_calls: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl Default for RecordingProvisioner {
    fn default() -> Self {
        RecordingProvisioner {
            up_calls: std::sync::Mutex::new(Vec::new()),
            down_calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl TunProvisioner for RecordingProvisioner {
    fn bring_up(&self, dev: &str, _cfg: &IfaceConfig) -> Result<(), String> {
        self.up_calls.lock().unwrap().push(dev.to_string());
        Ok(())
    }

    fn bring_down(&self, dev: &str) -> Result<(), String> {
        self.down_calls.lock().unwrap().push(dev.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_to_prefix_common_cases() {
        assert_eq!(netmask_to_prefix("255.255.255.0"), 24);
        assert_eq!(netmask_to_prefix("255.255.255.255"), 32);
        assert_eq!(netmask_to_prefix("255.0.0.0"), 8);
        assert_eq!(netmask_to_prefix("not-an-ip"), 32);
    }

    #[test]
    fn recording_provisioner_tracks_calls_in_order() {
        let p = RecordingProvisioner::default();
        let cfg = IfaceConfig {
            dev: "tun0".into(),
            mtu: 1500,
            ipv4: "10.8.0.1".into(),
            ipv4_netmask: "255.255.255.0".into(),
        };
        p.bring_up("tun0", &cfg).unwrap();
        p.bring_down("tun0").unwrap();
        assert_eq!(*p.up_calls.lock().unwrap(), vec!["tun0".to_string()]);
        assert_eq!(*p.down_calls.lock().unwrap(), vec!["tun0".to_string()]);
    }
}
