//! nodeup - tunnel node bootstrapper
//!
//! Provisions the platform helper binaries, launches them detached, discovers
//! the node's public hostname from the tunnel client's log (or takes the
//! configured fixed hostname), synthesizes the protocol links and serves the
//! derived subscription artifact over HTTP.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod enrich;
pub mod housekeeping;
pub mod links;
pub mod provision;
pub mod report;
pub mod server;
pub mod supervisor;

pub use config::{Args, EndpointSet, Settings};
