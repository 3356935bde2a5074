//! Stanza filter combinators.
//!
//! Filters decide which stanzas a listener or collector sees. They are
//! plain predicates; compose with [`and`] / [`or`].

use std::sync::Arc;

use crate::stanza::{IqType, MessageType, Stanza};

pub type StanzaFilter = Arc<dyn Fn(&Stanza) -> bool + Send + Sync>;

/// Accept everything.
pub fn any() -> StanzaFilter {
    Arc::new(|_| true)
}

/// Accept stanzas carrying the given id.
pub fn stanza_id(id: impl Into<String>) -> StanzaFilter {
    let id = id.into();
    Arc::new(move |s| s.id() == Some(id.as_str()))
}

/// Accept the reply to an IQ request: same id, type `result` or `error`.
pub fn iq_reply(id: impl Into<String>) -> StanzaFilter {
    let id = id.into();
    Arc::new(move |s| match s {
        Stanza::Iq(iq) => {
            iq.id == id && matches!(iq.itype, IqType::Result | IqType::Error)
        }
        _ => false,
    })
}

/// Accept messages of type `chat`, `normal` or `error` — the kinds a chat
/// session handles.
pub fn chat_messages() -> StanzaFilter {
    Arc::new(|s| match s {
        Stanza::Message(m) => matches!(
            m.mtype,
            MessageType::Chat | MessageType::Normal | MessageType::Error
        ),
        _ => false,
    })
}

/// Accept any `<iq>`.
pub fn iqs() -> StanzaFilter {
    Arc::new(|s| matches!(s, Stanza::Iq(_)))
}

/// Accept stanzas from the given service name.
pub fn from_peer(name: impl Into<String>) -> StanzaFilter {
    let name = name.into();
    Arc::new(move |s| s.from() == Some(name.as_str()))
}

pub fn and(a: StanzaFilter, b: StanzaFilter) -> StanzaFilter {
    Arc::new(move |s| a(s) && b(s))
}

pub fn or(a: StanzaFilter, b: StanzaFilter) -> StanzaFilter {
    Arc::new(move |s| a(s) || b(s))
}
