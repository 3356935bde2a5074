//! salut-engine — the XEP-0174 link-local session engine.
//!
//! An [`LLService`] advertises the local presence over DNS-SD, tracks
//! remote presences on the link, accepts and dials peer-to-peer XMPP
//! streams, and demultiplexes inbound stanzas into chats, packet
//! listeners, and cross-stream collectors.

pub mod chat;
pub mod collector;
pub mod listener;
pub mod service;
pub mod stream;

pub use chat::Chat;
pub use collector::PacketCollector;
pub use listener::{
    ChatListener, ConnectionListener, MessageListener, PacketInterceptor, PacketListener,
    ServiceStateListener,
};
pub use service::LLService;
pub use stream::{PeerStream, StreamRole, StreamState};

pub use salut_core::{filter, Error, Iq, IqType, LLPresence, Message, MessageType, Mode, Result, Stanza};
pub use salut_mdns::{Discovery, DiscoveryObserver, MdnsDiscovery, PresenceListener, PresenceStore};
