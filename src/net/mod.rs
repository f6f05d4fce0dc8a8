//! Registry network layer
//!
//! Workers talk to the coordinator exclusively through this module:
//!
//! - `protocol`: message definitions and framing
//! - `server`: coordinator-side endpoint, authenticates connections and
//!   dispatches registry operations
//! - `client`: worker-side handle, one private connection per worker

pub mod client;
pub mod protocol;
pub mod server;

// Re-export key types
pub use client::{ClientError, RegistryClient};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use server::RegistryServer;
