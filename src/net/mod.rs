//! Framed TCP wire adapter: protocol codec, server, and client.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RemoteFs;
pub use server::serve;
