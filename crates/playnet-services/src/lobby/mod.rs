//! Machine-wide lobby state: a named shared segment holding the table of
//! lobbied applications and a block arena for their connection settings.

pub mod arena;
pub mod registry;
pub mod segment;

pub use arena::{Arena, BlockHandle};
pub use registry::{LobbyAppEntry, NotifyFlags, SharedAppRegistry};
pub use segment::{Geometry, SharedSegment};
