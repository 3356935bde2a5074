//! salut-core — shared types for the salut link-local XMPP engine.
//! All other salut crates depend on this one.

pub mod config;
pub mod error;
pub mod filter;
pub mod presence;
pub mod stanza;
pub mod txt;
pub mod xml;

pub use error::{Error, Result};
pub use presence::{LLPresence, Mode};
pub use stanza::{Iq, IqType, Message, MessageType, Presence, Stanza};
