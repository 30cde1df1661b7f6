//! Server kernel: configuration, composition of the engine pieces, the
//! packet handlers, chat fan-out and the world clock.

pub mod bans;
pub mod chat;
pub mod config;
pub mod handlers;
pub mod log;
pub mod server;
pub mod tick;
