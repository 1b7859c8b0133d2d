//! Shared wire and domain types for the OTA hub.
//!
//! Everything here crosses a process boundary: device firmware polls with
//! these payloads, the operator UI renders them, and the server persists the
//! entity types through its repository port. Wire fields are camelCase JSON.

pub mod api;
pub mod device;
pub mod events;
pub mod firmware;
pub mod mac;
pub mod rollout;
pub mod version;

pub use api::*;
pub use device::*;
pub use events::*;
pub use firmware::*;
pub use mac::{InvalidMac, MacAddr};
pub use rollout::*;
pub use version::{FirmwareVersion, InvalidVersion};
