//! Credential check boundary (§4.5).
//!
//! `AuthAdapter` is the only way the state machine learns whether a
//! client may proceed past `ESTABLISHED`. It is pure from the core's
//! point of view — blocking is fine, since the core is single-reactor
//! and auth is expected to complete in milliseconds (§5).

/// The interface configuration the server echoes back to a newly
/// authenticated client in `AUTH_OK` (§4.4, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceCfg {
    pub dev: String,
    pub ipv4: String,
    pub netmask: String,
    pub mtu: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Assigned(IfaceCfg),
    Rejected,
}

pub trait AuthAdapter {
    fn authenticate(&self, username: &str, password: &str) -> AuthOutcome;
}

/// An adapter that accepts everyone with a fixed interface assignment.
/// Useful for tests and for a `--disable-auth`-style smoke deployment;
/// not wired into the CLI by default.
pub struct AllowAllAuth {
    pub assignment: IfaceCfg,
}

impl AuthAdapter for AllowAllAuth {
    fn authenticate(&self, _username: &str, _password: &str) -> AuthOutcome {
        AuthOutcome::Assigned(self.assignment.clone())
    }
}
