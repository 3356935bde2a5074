//! Typed XMPP stanzas and their XML serialization.
//!
//! Only the stanza surface the link-local engine needs: `<message>`,
//! `<iq>` and `<presence>` with the attributes and children XEP-0174
//! traffic actually carries. IQ payloads the engine does not understand
//! are kept as opaque XML so collectors and listeners can still inspect
//! them.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Escape a string for use in XML attribute values and text nodes.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Generate a fresh stanza id.
pub fn fresh_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("sl-{suffix}")
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&xml_escape(value));
    out.push('"');
}

fn push_opt_attr(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(v) = value {
        push_attr(out, name, v);
    }
}

fn push_text_child(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(v) = value {
        out.push('<');
        out.push_str(name);
        out.push('>');
        out.push_str(&xml_escape(v));
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Normal,
    Error,
    Headline,
    Groupchat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Normal => "normal",
            MessageType::Error => "error",
            MessageType::Headline => "headline",
            MessageType::Groupchat => "groupchat",
        }
    }

    /// Missing or unrecognized type attributes read as `normal` (RFC 6121 §5.2.2).
    pub fn parse(s: Option<&str>) -> MessageType {
        match s {
            Some("chat") => MessageType::Chat,
            Some("error") => MessageType::Error,
            Some("headline") => MessageType::Headline,
            Some("groupchat") => MessageType::Groupchat,
            _ => MessageType::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub mtype: MessageType,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub thread: Option<String>,
}

impl Message {
    /// A `type="chat"` message addressed to a peer.
    pub fn chat(to: impl Into<String>, body: impl Into<String>) -> Message {
        Message {
            id: Some(fresh_id()),
            to: Some(to.into()),
            from: None,
            mtype: MessageType::Chat,
            subject: None,
            body: Some(body.into()),
            thread: None,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<message");
        push_attr(&mut out, "type", self.mtype.as_str());
        push_opt_attr(&mut out, "id", self.id.as_deref());
        push_opt_attr(&mut out, "to", self.to.as_deref());
        push_opt_attr(&mut out, "from", self.from.as_deref());
        if self.subject.is_none() && self.body.is_none() && self.thread.is_none() {
            out.push_str("/>");
            return out;
        }
        out.push('>');
        push_text_child(&mut out, "subject", self.subject.as_deref());
        push_text_child(&mut out, "body", self.body.as_deref());
        push_text_child(&mut out, "thread", self.thread.as_deref());
        out.push_str("</message>");
        out
    }
}

// ── IQ ────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn parse(s: Option<&str>) -> IqType {
        match s {
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            _ => IqType::Get,
        }
    }
}

/// The child element of an IQ, kept as opaque XML. The engine routes IQs
/// by id and type; payload interpretation belongs to the layers above.
#[derive(Debug, Clone)]
pub struct IqPayload {
    pub name: String,
    pub namespace: String,
    pub xml: String,
}

/// An XMPP stanza-level error (`<error type="..."><condition/></error>`).
#[derive(Debug, Clone)]
pub struct StanzaError {
    pub etype: String,
    pub condition: String,
}

impl StanzaError {
    pub fn feature_not_implemented() -> StanzaError {
        StanzaError {
            etype: "cancel".to_string(),
            condition: "feature-not-implemented".to_string(),
        }
    }

    fn to_xml(&self) -> String {
        format!(
            "<error type=\"{}\"><{} xmlns=\"urn:ietf:params:xml:ns:xmpp-stanzas\"/></error>",
            xml_escape(&self.etype),
            self.condition
        )
    }
}

#[derive(Debug, Clone)]
pub struct Iq {
    pub id: String,
    pub to: Option<String>,
    pub from: Option<String>,
    pub itype: IqType,
    pub payload: Option<IqPayload>,
    pub error: Option<StanzaError>,
}

impl Iq {
    pub fn get(to: impl Into<String>, payload: IqPayload) -> Iq {
        Iq {
            id: fresh_id(),
            to: Some(to.into()),
            from: None,
            itype: IqType::Get,
            payload: Some(payload),
            error: None,
        }
    }

    /// A `result` reply to this IQ, addressed back to its sender.
    pub fn result_reply(&self, payload: Option<IqPayload>) -> Iq {
        Iq {
            id: self.id.clone(),
            to: self.from.clone(),
            from: self.to.clone(),
            itype: IqType::Result,
            payload,
            error: None,
        }
    }

    /// The auto-reply for an IQ get/set nobody handled: same id, type
    /// `error` with `feature-not-implemented`.
    pub fn feature_not_implemented_reply(&self) -> Iq {
        Iq {
            id: self.id.clone(),
            to: self.from.clone(),
            from: self.to.clone(),
            itype: IqType::Error,
            payload: None,
            error: Some(StanzaError::feature_not_implemented()),
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<iq");
        push_attr(&mut out, "type", self.itype.as_str());
        push_attr(&mut out, "id", &self.id);
        push_opt_attr(&mut out, "to", self.to.as_deref());
        push_opt_attr(&mut out, "from", self.from.as_deref());
        if self.payload.is_none() && self.error.is_none() {
            out.push_str("/>");
            return out;
        }
        out.push('>');
        if let Some(p) = &self.payload {
            out.push_str(&p.xml);
        }
        if let Some(e) = &self.error {
            out.push_str(&e.to_xml());
        }
        out.push_str("</iq>");
        out
    }
}

// ── Presence ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Presence {
    pub to: Option<String>,
    pub from: Option<String>,
    pub ptype: Option<String>,
    pub status: Option<String>,
}

impl Presence {
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<presence");
        push_opt_attr(&mut out, "type", self.ptype.as_deref());
        push_opt_attr(&mut out, "to", self.to.as_deref());
        push_opt_attr(&mut out, "from", self.from.as_deref());
        if self.status.is_none() {
            out.push_str("/>");
            return out;
        }
        out.push('>');
        push_text_child(&mut out, "status", self.status.as_deref());
        out.push_str("</presence>");
        out
    }
}

// ── Stanza ────────────────────────────────────────────────────────────────────

/// A top-level XML element on an XMPP stream.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Iq(Iq),
    Presence(Presence),
}

impl Stanza {
    pub fn to(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.to.as_deref(),
            Stanza::Iq(i) => i.to.as_deref(),
            Stanza::Presence(p) => p.to.as_deref(),
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.from.as_deref(),
            Stanza::Iq(i) => i.from.as_deref(),
            Stanza::Presence(p) => p.from.as_deref(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Iq(i) => Some(&i.id),
            Stanza::Presence(_) => None,
        }
    }

    /// Overwrite the `from` attribute. The session manager stamps every
    /// outbound stanza with the local service name, whatever the caller set.
    pub fn set_from(&mut self, from: impl Into<String>) {
        let from = from.into();
        match self {
            Stanza::Message(m) => m.from = Some(from),
            Stanza::Iq(i) => i.from = Some(from),
            Stanza::Presence(p) => p.from = Some(from),
        }
    }

    pub fn to_xml(&self) -> String {
        match self {
            Stanza::Message(m) => m.to_xml(),
            Stanza::Iq(i) => i.to_xml(),
            Stanza::Presence(p) => p.to_xml(),
        }
    }
}
