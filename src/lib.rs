//!Make a service that can only dial out reachable from outside.
//!
//!A node behind a firewall or NAT (such as a home gateway) only allows outbound connections.
//!natrelay gives such a node three ways to be reached.
//!
//!## Request relay
//!A public [`tcp::Relay`] listens on two ports. Clients connect to the client port and send a
//!request. Servers behind NAT keep dialing the server port; each server connection is handed
//!the oldest waiting request, writes back one response, and the relay returns it to the client.
//!One request is one connection is one read, there is no framing.
//!
//![`tcp::Client`] and [`tcp::Server`] wrap both ends so the application never talks to the
//!relay in the clear: every request and response is sealed with [`crypto::Cipher`].
//!
//!## Rendezvous
//!A public [`udp::Server`] keeps a registry of names. A server registers its name and keeps
//!pinging; a peer punches the name to learn the server's observed address and talk to it
//!directly. Registrations that stop pinging are evicted.
//!
//!The rendezvous server tells anyone who asks where a name lives. Run it on trusted networks.
//!
//!## Feature flags
//!For convenient, the crate include both client and server code by default.
//!Mostly you only use client or server code, set features to `client` or `server` instead.
//!
//!```toml
//!natrelay = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: tunnel client and server adapters, rendezvous client
//!- `server`: request relay, rendezvous server

pub mod crypto;
pub mod tcp;
pub mod udp;
