//! TCP request relay and tunnel adapters.
//!
//! use `Relay` to pair client requests with connections dialed in by servers.
//!
//! use `Client` and `Server` to carry application traffic through the relay encrypted.

#[cfg(feature = "server")]
mod relay;
#[cfg(feature = "server")]
pub use relay::{Relay, RelayOpts};

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::Client;
#[cfg(feature = "client")]
mod server;
#[cfg(feature = "client")]
pub use server::Server;
