//! Wire protocol: JSON envelopes exchanged with the routing server.
//!
//! ```text
//! { "type": "shell/create", "instanceId": "...", "clientId": "..." }
//! { "type": "shell/data",   "instanceId": "...", "clientId": "...", "data": "..." }
//! ```
//!
//! `shell/data` may carry `"encoding": "base64"`, in which case `data` is
//! base64 of raw terminal bytes. Without it, `data` is terminal text.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolDecodeError;

pub const SHELL_CREATE: &str = "shell/create";
pub const SHELL_DATA: &str = "shell/data";
pub const BASE64_ENCODING: &str = "base64";

/// Stable identifier of this installation, shared with the router.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier chosen by the remote side (the operator's `clientId`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellCreate {
    pub instance_id: InstanceId,
    pub client_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellData {
    pub instance_id: InstanceId,
    pub client_id: SessionId,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl ShellData {
    /// Raw bytes carried by this event.
    pub fn payload(&self) -> Result<Vec<u8>, ProtocolDecodeError> {
        match self.encoding.as_deref() {
            None | Some("text") => Ok(self.data.as_bytes().to_vec()),
            Some(BASE64_ENCODING) => Ok(STANDARD.decode(&self.data)?),
            Some(other) => Err(ProtocolDecodeError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// A routed event, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "shell/create")]
    Create(ShellCreate),
    #[serde(rename = "shell/data")]
    Data(ShellData),
}

impl Envelope {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Envelope::Create(event) => &event.instance_id,
            Envelope::Data(event) => &event.instance_id,
        }
    }
}

/// Minimal view of a frame: just enough to route it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Event(Envelope),
    /// A `type` this agent does not handle. Ignored for forward compatibility.
    Unknown { kind: String },
}

/// First decoding phase: read only the discriminant and routing fields.
pub fn peek(frame: &[u8]) -> Result<EnvelopeHeader, ProtocolDecodeError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Second decoding phase: decode the full variant named by `header`.
pub fn decode(header: &EnvelopeHeader, frame: &[u8]) -> Result<Decoded, ProtocolDecodeError> {
    let event = match header.kind.as_str() {
        SHELL_CREATE => Envelope::Create(serde_json::from_slice(frame)?),
        SHELL_DATA => Envelope::Data(serde_json::from_slice(frame)?),
        other => {
            return Ok(Decoded::Unknown {
                kind: other.to_string(),
            });
        }
    };
    Ok(Decoded::Event(event))
}

/// How outbound terminal bytes are carried in `shell/data`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    /// UTF-8 text, reassembled across chunk boundaries. What browser
    /// terminals behind the router expect.
    #[default]
    Text,
    /// Base64 of the raw bytes, tagged with `"encoding": "base64"`.
    Base64,
}

/// Turns a session's output chunks into `shell/data` envelopes.
///
/// In text mode a multi-byte UTF-8 sequence split across two reads is held
/// back and emitted whole with the next chunk, so only bytes that are
/// genuinely invalid get replaced.
#[derive(Debug)]
pub struct ChunkEncoder {
    encoding: DataEncoding,
    instance_id: InstanceId,
    session_id: SessionId,
    carry: Vec<u8>,
}

impl ChunkEncoder {
    pub fn new(encoding: DataEncoding, instance_id: InstanceId, session_id: SessionId) -> Self {
        Self {
            encoding,
            instance_id,
            session_id,
            carry: Vec::new(),
        }
    }

    /// Encode one chunk. Returns `None` when nothing is ready to send yet.
    pub fn encode(&mut self, chunk: &[u8]) -> Option<Envelope> {
        match self.encoding {
            DataEncoding::Base64 => {
                if chunk.is_empty() {
                    return None;
                }
                Some(self.envelope(STANDARD.encode(chunk), Some(BASE64_ENCODING)))
            }
            DataEncoding::Text => {
                let mut bytes = std::mem::take(&mut self.carry);
                bytes.extend_from_slice(chunk);
                let keep = incomplete_utf8_tail(&bytes);
                self.carry = bytes.split_off(bytes.len() - keep);
                if bytes.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&bytes).into_owned();
                Some(self.envelope(text, None))
            }
        }
    }

    /// Flush whatever is still held back. Called once the output has ended.
    pub fn finish(&mut self) -> Option<Envelope> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        let text = String::from_utf8_lossy(&rest).into_owned();
        Some(self.envelope(text, None))
    }

    fn envelope(&self, data: String, encoding: Option<&str>) -> Envelope {
        Envelope::Data(ShellData {
            instance_id: self.instance_id.clone(),
            client_id: self.session_id.clone(),
            data,
            encoding: encoding.map(str::to_string),
        })
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`, or 0.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}
