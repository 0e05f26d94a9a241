//! Peer-to-peer networking: wire codec, transports, peers, connection
//! management, discovery, and header sync.

pub mod addrman;
pub mod banlist;
pub mod connman;
pub mod message;
pub mod peer;
pub mod sync;
pub mod transport;
pub mod wire;

pub use connman::{ConnMan, NetConfig};
pub use message::Message;
pub use peer::{ConnType, Direction, Peer, PeerState};
