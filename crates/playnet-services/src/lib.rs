//! playnet-services — session discovery, request/reply correlation, the
//! player/group roster, and the machine-wide lobby registry.

pub mod correlator;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod lobby;
pub mod node;
pub mod providers;
pub mod roster;
pub mod transport;

pub use correlator::{PendingReply, Reply, ReplyCorrelator};
pub use directory::{SessionCacheEntry, SessionDirectory, Tick};
pub use discovery::{Broadcaster, EnumEvent};
pub use error::{PlayError, PlayResult};
pub use lobby::{LobbyAppEntry, NotifyFlags, SharedAppRegistry};
pub use node::{Node, NodeRole};
pub use providers::ProviderCatalogue;
pub use roster::{Dpid, GroupInfo, PlayerInfo, RequestedId, Roster};
pub use transport::{Transport, UdpTransport};
