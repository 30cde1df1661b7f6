#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Support library shared by every crate in the workspace: logging plumbing,
//! wall-clock helpers, the session stream ciphers and the data-provider
//! contract.

/// Protocol version announced in the handshake. Peers speaking a different
/// version are rejected during login.
pub const PROTOCOL_VERSION: u32 = 51;

pub mod crypto;
pub mod logging;
pub mod store;
pub mod time;
