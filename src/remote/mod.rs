//! Inter-node forwarding of records to the node that owns their role.

pub mod client;
pub mod codec;
pub mod server;

pub use client::RemoteClient;
pub use codec::{RemoteData, RemoteMessage, WireError};
pub use server::RemoteServer;
