//! Link-local presence records (XEP-0174).
//!
//! A presence is the identity one peer advertises over DNS-SD, keyed by
//! its service name (the DNS-SD instance label, e.g. `juliet@capulet`).
//! The well-known TXT fields:
//!
//! ```text
//! juliet IN TXT "txtvers=1"
//! juliet IN TXT "1st=Juliet"
//! juliet IN TXT "email=juliet@capulet.lit"
//! juliet IN TXT "jid=juliet@capulet.lit"
//! juliet IN TXT "last=Capulet"
//! juliet IN TXT "msg=Hanging out downtown"
//! juliet IN TXT "nick=JuliC"
//! juliet IN TXT "port.p2pj=5562"
//! juliet IN TXT "status=avail"
//! ```

use std::collections::BTreeMap;

/// Availability mode. A missing or unrecognized `status` field reads as
/// `avail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Avail,
    Away,
    Dnd,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Avail => "avail",
            Mode::Away => "away",
            Mode::Dnd => "dnd",
        }
    }

    pub fn parse(s: &str) -> Mode {
        match s {
            "avail" => Mode::Avail,
            "away" => Mode::Away,
            "dnd" => Mode::Dnd,
            other => {
                tracing::warn!(status = other, "invalid presence status, mapping to avail");
                Mode::Avail
            }
        }
    }
}

/// A link-local presence: service name, host/port, and the TXT-visible
/// identity fields.
#[derive(Debug, Clone)]
pub struct LLPresence {
    service_name: String,
    host: String,
    port: u16,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub jid: Option<String>,
    pub nick: Option<String>,
    pub msg: Option<String>,
    pub hash: Option<String>,
    pub node: Option<String>,
    pub ver: Option<String>,
    pub status: Mode,
    extras: BTreeMap<String, String>,
}

impl LLPresence {
    pub fn new(service_name: impl Into<String>) -> LLPresence {
        LLPresence {
            service_name: service_name.into(),
            host: String::new(),
            port: 0,
            first_name: None,
            last_name: None,
            email: None,
            jid: None,
            nick: None,
            msg: None,
            hash: None,
            node: None,
            ver: None,
            status: Mode::Avail,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_addr(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> LLPresence {
        let mut p = LLPresence::new(service_name);
        p.host = host.into();
        p.port = port;
        p
    }

    /// Build a presence from resolved DNS-SD data.
    pub fn from_txt(
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        records: &[(String, String)],
    ) -> LLPresence {
        let mut p = LLPresence::with_addr(service_name, host, port);
        for (key, value) in records {
            match key.as_str() {
                "1st" => p.first_name = Some(value.clone()),
                "last" => p.last_name = Some(value.clone()),
                "email" => p.email = Some(value.clone()),
                "jid" => p.jid = Some(value.clone()),
                "nick" => p.nick = Some(value.clone()),
                "hash" => p.hash = Some(value.clone()),
                "node" => p.node = Some(value.clone()),
                "ver" => p.ver = Some(value.clone()),
                "msg" => p.msg = Some(value.clone()),
                "status" => p.status = Mode::parse(value),
                // Emitted by us on the encode side; not identity data.
                "txtvers" | "port.p2pj" => {}
                _ => {
                    p.extras.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        p
    }

    /// The TXT field map this presence advertises. `txtvers=1` is always
    /// emitted; `port.p2pj` echoes the SRV port for legacy consumers.
    pub fn to_txt(&self) -> Vec<(String, String)> {
        fn push(out: &mut Vec<(String, String)>, key: &str, value: &Option<String>) {
            if let Some(v) = value {
                out.push((key.to_string(), v.clone()));
            }
        }
        let mut out = vec![("txtvers".to_string(), "1".to_string())];
        push(&mut out, "1st", &self.first_name);
        push(&mut out, "last", &self.last_name);
        push(&mut out, "email", &self.email);
        push(&mut out, "jid", &self.jid);
        push(&mut out, "nick", &self.nick);
        out.push(("status".to_string(), self.status.as_str().to_string()));
        push(&mut out, "msg", &self.msg);
        push(&mut out, "hash", &self.hash);
        push(&mut out, "node", &self.node);
        push(&mut out, "ver", &self.ver);
        out.push(("port.p2pj".to_string(), self.port.to_string()));
        for (k, v) in &self.extras {
            out.push((k.clone(), v.clone()));
        }
        out
    }

    /// Merge the TXT-visible fields of `other` into this presence.
    /// Addressing (service name, host, port) is not touched.
    pub fn update(&mut self, other: &LLPresence) {
        self.first_name = other.first_name.clone();
        self.last_name = other.last_name.clone();
        self.email = other.email.clone();
        self.jid = other.jid.clone();
        self.nick = other.nick.clone();
        self.msg = other.msg.clone();
        self.status = other.status;
        self.extras = other.extras.clone();
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn set_service_name(&mut self, name: impl Into<String>) {
        self.service_name = name.into();
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extras.insert(key.into(), value.into());
    }
}

/// Two presences are the same peer iff service name and host match.
/// Port is deliberately excluded: collision renaming can rebind it.
impl PartialEq for LLPresence {
    fn eq(&self, other: &LLPresence) -> bool {
        self.service_name == other.service_name && self.host == other.host
    }
}

impl Eq for LLPresence {}

impl std::hash::Hash for LLPresence {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.service_name.hash(state);
    }
}
