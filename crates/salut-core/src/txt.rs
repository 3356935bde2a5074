//! DNS TXT payload codec.
//!
//! A raw mDNS TXT payload is a concatenation of length-prefixed records:
//! one byte length N followed by N bytes of UTF-8 `key=value` (or a bare
//! `key`, which carries no presence information and is dropped).

use crate::error::{Error, Result};

/// DNS limits a single TXT record to 255 bytes.
const MAX_RECORD_LEN: usize = 255;

/// Decode a raw TXT payload into key/value pairs.
///
/// Invalid UTF-8 or a truncated record is a hard failure: it means the
/// peer mis-encoded its presence, and the affected presence must not be
/// published.
pub fn decode(raw: &[u8]) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let len = raw[i] as usize;
        i += 1;
        if i + len > raw.len() {
            return Err(Error::StreamProtocol(format!(
                "truncated TXT record: {} bytes declared, {} remain",
                len,
                raw.len() - i
            )));
        }
        let record = std::str::from_utf8(&raw[i..i + len])
            .map_err(|e| Error::StreamProtocol(format!("invalid UTF-8 in TXT record: {e}")))?;
        i += len;
        match record.split_once('=') {
            Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
            // A bare key without '=' carries nothing; drop it.
            None => {}
        }
    }
    Ok(pairs)
}

/// Encode key/value pairs into a raw TXT payload. Each record is emitted
/// as `key=value`, truncated to the DNS per-record limit of 255 bytes.
pub fn encode(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        let record = format!("{key}={value}");
        let bytes = record.as_bytes();
        let len = if bytes.len() > MAX_RECORD_LEN {
            // Truncate on a char boundary so the record stays valid UTF-8.
            let mut cut = MAX_RECORD_LEN;
            while !record.is_char_boundary(cut) {
                cut -= 1;
            }
            cut
        } else {
            bytes.len()
        };
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out
}

/// Normalize pairs through the wire codec, applying the per-record size
/// limit the same way the DNS layer will.
pub fn sanitize(pairs: &[(String, String)]) -> Vec<(String, String)> {
    // encode() cannot produce invalid UTF-8 or truncated records.
    decode(&encode(pairs)).unwrap_or_default()
}
