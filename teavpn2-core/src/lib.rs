//! Protocol core and single-reactor event loop for a TeaVPN2-style
//! layer-3 VPN concentrator.
//!
//! This crate has no `fn main` and never touches `std::env`; a binary
//! crate parses a `Configuration`, picks an `AuthAdapter` and a
//! `TunProvisioner`, and drives everything through `Lifecycle`.

pub mod auth;
pub mod client;
pub mod config;
pub mod counters;
pub mod error;
pub mod lifecycle;
pub mod packet;
pub mod provision;
pub mod reactor;
pub mod slot;
pub mod state_machine;
pub mod tun;

pub use auth::{AuthAdapter, AuthOutcome, IfaceCfg};
pub use client::ClientRecord;
pub use config::Configuration;
pub use error::StartupError;
pub use lifecycle::Lifecycle;
pub use provision::TunProvisioner;
pub use reactor::Reactor;
pub use slot::FreeStack;
pub use tun::{TunDevice, TunIo};
