//! playnet-core — shared types, wire format, and configuration.
//! All other Playnet crates depend on this one.

pub mod config;
pub mod guid;
pub mod settings;
pub mod wire;

pub use guid::Guid;
pub use settings::{ConnectionSettings, PlayerName};
pub use wire::{CommandId, Message, SessionDescriptor, SessionFlags, WireError};
