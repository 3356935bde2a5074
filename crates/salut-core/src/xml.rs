//! XMPP stream framing and stanza parsing.
//!
//! An XMPP stream is one long XML document: a `<stream:stream>` root whose
//! top-level children are the stanzas. TCP hands us arbitrary byte chunks,
//! so [`StreamFramer`] accumulates bytes and yields complete stream events
//! as they become parseable: the opening header, each top-level stanza,
//! stream-level errors, and the closing tag.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::stanza::{Iq, IqPayload, IqType, Message, MessageType, Presence, Stanza, StanzaError};

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";

/// Closing tag of the stream root.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Guard against unbounded buffer growth from malformed input that never
/// forms a complete stanza. Typical stanzas are a few KB.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Render the opening stream header. Both `to` and `from` are mandatory
/// on link-local streams (XEP-0174 §4.3).
pub fn stream_header(to: &str, from: &str) -> String {
    format!(
        "<stream:stream to=\"{}\" from=\"{}\" xmlns=\"{}\" xmlns:stream=\"{}\" version=\"1.0\">",
        crate::stanza::xml_escape(to),
        crate::stanza::xml_escape(from),
        NS_CLIENT,
        NS_STREAM,
    )
}

/// Attributes of a received `<stream:stream>` opening tag.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub version: Option<String>,
}

/// One parsed event on an XMPP stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The remote side opened its stream.
    Opened(StreamHeader),
    /// A complete top-level stanza.
    Stanza(Stanza),
    /// A stream-level `<error>`; the stream is dead.
    StreamError(String),
    /// The remote side sent `</stream:stream>`.
    Closed,
}

/// Incremental framer over the raw TCP byte sequence of one stream.
#[derive(Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
}

impl StreamFramer {
    pub fn new() -> StreamFramer {
        StreamFramer::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete event out of the buffer, or `None` when more
    /// bytes are needed. A parse failure is fatal for the stream.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        if self.buf.len() > MAX_BUFFER_SIZE {
            return Err(Error::StreamProtocol(format!(
                "stanza buffer exceeded {MAX_BUFFER_SIZE} bytes without a complete stanza"
            )));
        }
        let Some((chunk, consumed)) = extract(&self.buf)? else {
            return Ok(None);
        };
        self.buf.drain(..consumed);
        let event = match chunk {
            Chunk::StreamOpen(xml) => StreamEvent::Opened(parse_stream_header(&xml)?),
            Chunk::StreamClose => StreamEvent::Closed,
            Chunk::TopLevel(xml) => match parse_top_level(&xml)? {
                TopLevel::Stanza(stanza) => StreamEvent::Stanza(stanza),
                TopLevel::StreamError(text) => StreamEvent::StreamError(text),
            },
        };
        Ok(Some(event))
    }
}

enum Chunk {
    StreamOpen(String),
    StreamClose,
    TopLevel(String),
}

fn is_stream_root(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Extract one complete top-level element from the buffer.
///
/// Depth tracking over pull-parser events: a stanza is complete when its
/// depth returns to zero. `Eof` and an unclosed tag both mean the buffer
/// holds a partial element that the next TCP read will complete.
fn extract(buffer: &[u8]) -> Result<Option<(Chunk, usize)>> {
    // The stream closing tag has no opening counterpart in the buffer, so
    // the depth machinery below would misread it. Handle it up front.
    if let Some(start) = buffer.iter().position(|b| !b.is_ascii_whitespace()) {
        if buffer[start..].starts_with(STREAM_CLOSE.as_bytes()) {
            return Ok(Some((Chunk::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut start_pos: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Start(e)) => {
                if depth == 0 {
                    if is_stream_root(e.name().as_ref()) {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((Chunk::StreamOpen(bytes_to_string(&buffer[..end])), end)));
                    }
                    start_pos = pos;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    if is_stream_root(e.name().as_ref()) {
                        return Ok(Some((Chunk::StreamClose, end)));
                    }
                    return Ok(Some((Chunk::TopLevel(bytes_to_string(&buffer[pos..end])), end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 {
                    if is_stream_root(e.name().as_ref()) {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((Chunk::StreamClose, end)));
                    }
                    return Err(Error::StreamProtocol(
                        "unexpected end tag at stream level".to_string(),
                    ));
                }
                depth -= 1;
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Chunk::TopLevel(bytes_to_string(&buffer[start_pos..end])), end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // A partial tag at the end of the buffer; more data is coming.
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return Ok(None),
            Err(e) => return Err(Error::StreamProtocol(format!("malformed XML: {e}"))),
        }
    }
}

fn attr_map(e: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::StreamProtocol(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::StreamProtocol(format!("bad attribute value: {e}")))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn parse_stream_header(xml: &str) -> Result<StreamHeader> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().check_end_names = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if is_stream_root(e.name().as_ref()) => {
                let attrs = attr_map(&e)?;
                match attr(&attrs, "xmlns") {
                    Some(NS_CLIENT) => {}
                    other => {
                        return Err(Error::StreamProtocol(format!(
                            "stream namespace must be '{NS_CLIENT}', got {other:?}"
                        )))
                    }
                }
                return Ok(StreamHeader {
                    to: attr(&attrs, "to").map(String::from),
                    from: attr(&attrs, "from").map(String::from),
                    version: attr(&attrs, "version").map(String::from),
                });
            }
            Ok(Event::Decl(_)) | Ok(Event::Text(_)) => {}
            Ok(_) | Err(_) => {
                return Err(Error::StreamProtocol("malformed stream header".to_string()))
            }
        }
    }
}

enum TopLevel {
    Stanza(Stanza),
    StreamError(String),
}

/// Parse one complete top-level element into a typed stanza.
fn parse_top_level(xml: &str) -> Result<TopLevel> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().check_end_names = false;
    loop {
        let (element, self_closing) = match reader.read_event() {
            Ok(Event::Start(e)) => (e, false),
            Ok(Event::Empty(e)) => (e, true),
            Ok(Event::Decl(_)) | Ok(Event::Text(_)) | Ok(Event::Comment(_)) => continue,
            Ok(Event::Eof) => return Err(Error::StreamProtocol("empty stanza".to_string())),
            Ok(_) => return Err(Error::StreamProtocol("unexpected stream content".to_string())),
            Err(e) => return Err(Error::StreamProtocol(format!("malformed stanza: {e}"))),
        };
        let name = String::from_utf8_lossy(element.name().local_name().as_ref()).into_owned();
        let attrs = attr_map(&element)?;
        return match name.as_str() {
            "message" => Ok(TopLevel::Stanza(Stanza::Message(parse_message(
                &mut reader,
                &attrs,
                self_closing,
            )?))),
            "iq" => Ok(TopLevel::Stanza(Stanza::Iq(parse_iq(
                xml,
                &mut reader,
                &attrs,
                self_closing,
            )?))),
            "presence" => Ok(TopLevel::Stanza(Stanza::Presence(parse_presence(
                &mut reader,
                &attrs,
                self_closing,
            )?))),
            "error" => Ok(TopLevel::StreamError(parse_stream_error(
                &mut reader,
                self_closing,
            )?)),
            other => Err(Error::StreamProtocol(format!(
                "unsupported top-level element '{other}'"
            ))),
        };
    }
}

fn parse_message(
    reader: &mut Reader<&[u8]>,
    attrs: &[(String, String)],
    self_closing: bool,
) -> Result<Message> {
    let mut msg = Message {
        id: attr(attrs, "id").map(String::from),
        to: attr(attrs, "to").map(String::from),
        from: attr(attrs, "from").map(String::from),
        mtype: MessageType::parse(attr(attrs, "type")),
        subject: None,
        body: None,
        thread: None,
    };
    if self_closing {
        return Ok(msg);
    }
    let mut depth = 0u32;
    let mut capture: Option<String> = None;
    let mut text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 {
                    let child = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                    if matches!(child.as_str(), "subject" | "body" | "thread") {
                        capture = Some(child);
                        text.clear();
                    }
                }
                depth += 1;
            }
            Ok(Event::Text(t)) => {
                if capture.is_some() && depth == 1 {
                    text.push_str(
                        &t.unescape()
                            .map_err(|e| Error::StreamProtocol(format!("bad text: {e}")))?,
                    );
                }
            }
            Ok(Event::CData(t)) => {
                if capture.is_some() && depth == 1 {
                    text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(field) = capture.take() {
                        let value = Some(text.clone());
                        match field.as_str() {
                            "subject" => msg.subject = value,
                            "body" => msg.body = value,
                            "thread" => msg.thread = value,
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::StreamProtocol(format!("malformed message: {e}"))),
        }
    }
    Ok(msg)
}

/// Parse an IQ. The first non-error child element is captured verbatim as
/// the opaque payload; a `<error>` child is lifted into a typed error.
fn parse_iq(
    xml: &str,
    reader: &mut Reader<&[u8]>,
    attrs: &[(String, String)],
    self_closing: bool,
) -> Result<Iq> {
    let mut iq = Iq {
        id: attr(attrs, "id").unwrap_or_default().to_string(),
        to: attr(attrs, "to").map(String::from),
        from: attr(attrs, "from").map(String::from),
        itype: IqType::parse(attr(attrs, "type")),
        payload: None,
        error: None,
    };
    if self_closing {
        return Ok(iq);
    }
    let mut depth = 0u32;
    let mut in_error = false;
    let mut error_type = String::new();
    let mut payload_start: Option<usize> = None;
    let mut payload_meta: Option<(String, String)> = None;
    let mut payload_done = false;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let child = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                if depth == 0 {
                    if child == "error" {
                        in_error = true;
                        error_type = attr(&attr_map(&e)?, "type").unwrap_or("cancel").to_string();
                    } else if !payload_done && payload_meta.is_none() {
                        let ns = attr(&attr_map(&e)?, "xmlns").unwrap_or_default().to_string();
                        payload_meta = Some((child, ns));
                        payload_start = Some(pos);
                    }
                } else if in_error && depth == 1 && iq.error.is_none() {
                    iq.error = Some(StanzaError {
                        etype: error_type.clone(),
                        condition: child,
                    });
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                let child = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                if depth == 0 {
                    if child != "error" && !payload_done && payload_meta.is_none() {
                        let ns = attr(&attr_map(&e)?, "xmlns").unwrap_or_default().to_string();
                        let end = reader.buffer_position() as usize;
                        iq.payload = Some(IqPayload {
                            name: child,
                            namespace: ns,
                            xml: xml[pos..end].to_string(),
                        });
                        payload_done = true;
                    }
                } else if in_error && depth == 1 && iq.error.is_none() {
                    iq.error = Some(StanzaError {
                        etype: error_type.clone(),
                        condition: child,
                    });
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    if in_error {
                        in_error = false;
                    } else if let (Some(start), Some((name, ns))) =
                        (payload_start.take(), payload_meta.take())
                    {
                        let end = reader.buffer_position() as usize;
                        iq.payload = Some(IqPayload {
                            name,
                            namespace: ns,
                            xml: xml[start..end].to_string(),
                        });
                        payload_done = true;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::StreamProtocol(format!("malformed iq: {e}"))),
        }
    }
    Ok(iq)
}

fn parse_presence(
    reader: &mut Reader<&[u8]>,
    attrs: &[(String, String)],
    self_closing: bool,
) -> Result<Presence> {
    let mut presence = Presence {
        to: attr(attrs, "to").map(String::from),
        from: attr(attrs, "from").map(String::from),
        ptype: attr(attrs, "type").map(String::from),
        status: None,
    };
    if self_closing {
        return Ok(presence);
    }
    let mut depth = 0u32;
    let mut in_status = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 && e.name().local_name().as_ref() == b"status" {
                    in_status = true;
                }
                depth += 1;
            }
            Ok(Event::Text(t)) => {
                if in_status && depth == 1 {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::StreamProtocol(format!("bad text: {e}")))?;
                    presence.status = Some(text.into_owned());
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    in_status = false;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::StreamProtocol(format!("malformed presence: {e}"))),
        }
    }
    Ok(presence)
}

fn parse_stream_error(reader: &mut Reader<&[u8]>, self_closing: bool) -> Result<String> {
    if self_closing {
        return Ok("stream error".to_string());
    }
    let mut condition = String::new();
    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth == 0 && condition.is_empty() {
                    condition = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 && condition.is_empty() {
                    condition = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
                }
            }
            Ok(Event::Text(t)) => {
                if condition.is_empty() {
                    if let Ok(text) = t.unescape() {
                        let trimmed = text.trim().to_string();
                        if !trimmed.is_empty() {
                            condition = trimmed;
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::StreamProtocol(format!("malformed stream error: {e}"))),
        }
    }
    if condition.is_empty() {
        condition = "stream error".to_string();
    }
    Ok(condition)
}
