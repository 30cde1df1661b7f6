#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Engine library: the wire protocol, the connection layer, per-peer
//! sessions, packet routing and the column store.

pub mod client;
pub mod net;
pub mod protocol;
pub mod router;
pub mod world;
