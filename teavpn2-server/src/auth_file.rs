//! File-backed `AuthAdapter` (§4.5, §6): each user is one line in
//! `${data_dir}/users/<username>` holding the expected password.
//!
//! This is the simplest format consistent with the core's Non-goal on
//! credential storage — `teavpn2-core` only depends on the `AuthAdapter`
//! trait, never on this file layout.

use std::fs;
use std::path::PathBuf;

use teavpn2_core::auth::{AuthAdapter, AuthOutcome};
use teavpn2_core::config::IfaceConfig;
use teavpn2_core::IfaceCfg;

pub struct FileAuthAdapter {
    users_dir: PathBuf,
    assignment: IfaceCfg,
}

impl FileAuthAdapter {
    /// `iface` is the server's own interface configuration, echoed back
    /// to every successfully authenticated client as its assignment —
    /// this core has no per-client address pool (out of scope, §1).
    pub fn new(data_dir: String, iface: IfaceConfig) -> Self {
        FileAuthAdapter {
            users_dir: PathBuf::from(data_dir).join("users"),
            assignment: IfaceCfg {
                dev: iface.dev,
                ipv4: iface.ipv4,
                netmask: iface.ipv4_netmask,
                mtu: iface.mtu,
            },
        }
    }
}

impl AuthAdapter for FileAuthAdapter {
    fn authenticate(&self, username: &str, password: &str) -> AuthOutcome {
        if username.is_empty() || username.contains(|c| c == '/' || c == '\0') {
            return AuthOutcome::Rejected;
        }

        let path = self.users_dir.join(username);
        match fs::read_to_string(&path) {
            Ok(contents) if contents.trim_end_matches(|c| c == '\n' || c == '\r') == password => {
                AuthOutcome::Assigned(self.assignment.clone())
            }
            _ => AuthOutcome::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_iface() -> IfaceConfig {
        IfaceConfig {
            dev: "tvpn0".into(),
            mtu: 1400,
            ipv4: "10.8.0.1".into(),
            ipv4_netmask: "255.255.255.0".into(),
        }
    }

    #[test]
    fn accepts_matching_password_and_rejects_mismatch() {
        let dir = std::env::temp_dir().join(format!("teavpn2-test-users-{}", std::process::id()));
        let users_dir = dir.join("users");
        fs::create_dir_all(&users_dir).unwrap();
        let mut f = fs::File::create(users_dir.join("alice")).unwrap();
        writeln!(f, "correct-horse").unwrap();

        let adapter = FileAuthAdapter::new(dir.display().to_string(), sample_iface());
        assert!(matches!(
            adapter.authenticate("alice", "correct-horse"),
            AuthOutcome::Assigned(_)
        ));
        assert!(matches!(
            adapter.authenticate("alice", "wrong"),
            AuthOutcome::Rejected
        ));
        assert!(matches!(
            adapter.authenticate("nobody", "anything"),
            AuthOutcome::Rejected
        ));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_path_traversal_attempts() {
        let dir = std::env::temp_dir().join(format!("teavpn2-test-traversal-{}", std::process::id()));
        let adapter = FileAuthAdapter::new(dir.display().to_string(), sample_iface());
        assert!(matches!(
            adapter.authenticate("../../etc/passwd", "x"),
            AuthOutcome::Rejected
        ));
    }
}
