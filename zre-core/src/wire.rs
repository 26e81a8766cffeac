//! Framing: bit-exact ZRE encoding of [`Message`] into transport frames.
//!
//! Layout of the first frame, all integers big-endian:
//!
//! ```text
//! signature  2 bytes  0xAAA1
//! id         1 byte   command id
//! version    1 byte   2
//! sequence   2 bytes
//! ...        per-command fields
//! ```
//!
//! Strings are a 1-byte length followed by raw bytes. String lists are a
//! 1-byte count followed by strings. Headers are a 1-byte count followed by
//! `key=value` strings. WHISPER and SHOUT content follows as extra frames.

use crate::protocol::{
    command_id, Body, Content, Headers, Hello, Message, PROTOCOL_VERSION, SIGNATURE,
};

/// Longest string a 1-byte length prefix can describe.
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

/// Most entries a 1-byte count can describe.
pub const MAX_ITEMS: usize = u8::MAX as usize;

/// Encode a message into its frames: the fixed-field frame first, then any content frames.
pub fn encode(msg: &Message) -> Result<Vec<Vec<u8>>, EncodeError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&SIGNATURE.to_be_bytes());
    out.push(msg.id());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&msg.sequence.to_be_bytes());

    let mut frames = Vec::with_capacity(1);
    match &msg.body {
        Body::Hello(hello) => {
            put_string(&mut out, "endpoint", &hello.endpoint)?;
            put_strings(&mut out, "groups", &hello.groups)?;
            out.push(hello.status);
            put_string(&mut out, "name", &hello.name)?;
            put_headers(&mut out, &hello.headers)?;
            frames.push(out);
        }
        Body::Whisper { content } => {
            frames.push(out);
            frames.extend(content.iter().cloned());
        }
        Body::Shout { group, content } => {
            put_string(&mut out, "group", group)?;
            frames.push(out);
            frames.extend(content.iter().cloned());
        }
        Body::Join { group, status } | Body::Leave { group, status } => {
            put_string(&mut out, "group", group)?;
            out.push(*status);
            frames.push(out);
        }
        Body::Ping | Body::PingOk => frames.push(out),
    }
    Ok(frames)
}

/// Decode a message from its frames. Frames after the first are content for
/// WHISPER and SHOUT and are ignored for every other command.
pub fn decode(mut frames: Content) -> Result<Message, MalformedMessage> {
    if frames.is_empty() {
        return Err(MalformedMessage::Empty);
    }
    let head = frames.remove(0);
    decode_parts(&head, frames)
}

/// Decode a single-frame message (no content frames).
pub fn decode_frame(bytes: &[u8]) -> Result<Message, MalformedMessage> {
    decode_parts(bytes, Vec::new())
}

fn decode_parts(head: &[u8], content: Content) -> Result<Message, MalformedMessage> {
    let mut r = Reader::new(head);
    let signature = r.u16("signature")?;
    if signature != SIGNATURE {
        return Err(MalformedMessage::BadSignature(signature));
    }
    let id = r.u8("id")?;
    if !(command_id::HELLO..=command_id::PING_OK).contains(&id) {
        return Err(MalformedMessage::UnknownCommand(id));
    }
    let version = r.u8("version")?;
    if version != PROTOCOL_VERSION {
        return Err(MalformedMessage::BadVersion(version));
    }
    let sequence = r.u16("sequence")?;

    let body = match id {
        command_id::HELLO => {
            let endpoint = r.string("endpoint")?;
            let groups = r.strings("groups")?;
            let status = r.u8("status")?;
            let name = r.string("name")?;
            let headers = r.headers()?;
            Body::Hello(Hello {
                endpoint,
                groups,
                status,
                name,
                headers,
            })
        }
        command_id::WHISPER => Body::Whisper { content },
        command_id::SHOUT => Body::Shout {
            group: r.string("group")?,
            content,
        },
        command_id::JOIN => Body::Join {
            group: r.string("group")?,
            status: r.u8("status")?,
        },
        command_id::LEAVE => Body::Leave {
            group: r.string("group")?,
            status: r.u8("status")?,
        },
        command_id::PING => Body::Ping,
        _ => Body::PingOk,
    };
    Ok(Message { sequence, body })
}

fn put_string(out: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), EncodeError> {
    if s.len() > MAX_STRING_LEN {
        return Err(EncodeError::StringTooLong { field, len: s.len() });
    }
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_strings(out: &mut Vec<u8>, field: &'static str, list: &[String]) -> Result<(), EncodeError> {
    if list.len() > MAX_ITEMS {
        return Err(EncodeError::TooManyItems {
            field,
            count: list.len(),
        });
    }
    out.push(list.len() as u8);
    for s in list {
        put_string(out, field, s)?;
    }
    Ok(())
}

fn put_headers(out: &mut Vec<u8>, headers: &Headers) -> Result<(), EncodeError> {
    if headers.len() > MAX_ITEMS {
        return Err(EncodeError::TooManyItems {
            field: "headers",
            count: headers.len(),
        });
    }
    out.push(headers.len() as u8);
    for (key, value) in headers {
        if key.contains('=') {
            return Err(EncodeError::HeaderKey(key.clone()));
        }
        put_string(out, "headers", &format!("{key}={value}"))?;
    }
    Ok(())
}

/// Bounds-checked cursor over the fixed-field frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], MalformedMessage> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(MalformedMessage::Truncated(field))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, MalformedMessage> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, MalformedMessage> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn string(&mut self, field: &'static str) -> Result<String, MalformedMessage> {
        let len = self.u8(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MalformedMessage::InvalidUtf8(field))
    }

    fn strings(&mut self, field: &'static str) -> Result<Vec<String>, MalformedMessage> {
        let count = self.u8(field)? as usize;
        (0..count).map(|_| self.string(field)).collect()
    }

    fn headers(&mut self) -> Result<Headers, MalformedMessage> {
        let count = self.u8("headers")? as usize;
        let mut headers = Headers::new();
        for _ in 0..count {
            let entry = self.string("headers")?;
            let (key, value) = entry.split_once('=').ok_or(MalformedMessage::BadHeader)?;
            headers.insert(key.to_string(), value.to_string());
        }
        Ok(headers)
    }
}

/// Error encoding a message: a field does not fit its length prefix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("{field} string is {len} bytes, limit is 255")]
    StringTooLong { field: &'static str, len: usize },
    #[error("{field} has {count} entries, limit is 255")]
    TooManyItems { field: &'static str, count: usize },
    #[error("header key {0:?} contains '='")]
    HeaderKey(String),
}

/// Error decoding a message. The offending frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("no frames")]
    Empty,
    #[error("truncated while reading {0}")]
    Truncated(&'static str),
    #[error("invalid signature {0:#06x}")]
    BadSignature(u16),
    #[error("unknown command id {0}")]
    UnknownCommand(u8),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("header entry without '='")]
    BadHeader,
}
