//! The proxy engine and its inbound listeners.

pub mod client;
pub mod engine;
pub mod server;

pub use engine::ProxyEngine;
pub use server::{ProxyServer, DRAIN_DEADLINE};
