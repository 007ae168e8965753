//! Data models for the notification relay.
//!
//! Serialized shapes match what the client application consumes over the API.

mod device;
mod notification;
mod topic;

pub use device::*;
pub use notification::*;
pub use topic::*;
