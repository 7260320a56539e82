//! UDP rendezvous.
//!
//! use `Server` to run the rendezvous broker.
//!
//! use `Client` to register a name and keep it alive, or to punch a registered name.

pub mod proto;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Client, PING_INTERVAL, ROUND_TRIP_TIMEOUT};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{Server, HEARTBEAT_TIMEOUT};
