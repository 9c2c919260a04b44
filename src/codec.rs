//! Wire message codec
//!
//! Frames, signs, and parses individual wire messages. Pure transformation,
//! no I/O: the codec maps a [`WireMessage`] to and from the multipart frame
//! list a channel socket carries.
//!
//! Frame layout: zero or more routing identity frames (ignored), the
//! `<IDS|MSG>` delimiter, the hex HMAC-SHA256 signature, then the four JSON
//! frames (header, parent header, metadata, content), then any binary
//! buffers. The signature covers exactly the four JSON frames and is verified
//! before anything is parsed.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::connection::{ConnectionInfo, SIGNATURE_SCHEME};
use crate::wire::{MessageHeader, WireMessage};
use crate::{Error, Result};

/// Frame separating routing identities from the signed message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

type HmacSha256 = Hmac<Sha256>;

/// Signs and parses wire messages with a shared HMAC key.
///
/// An empty key disables signing entirely (empty signature frame, no
/// verification), matching the reference client's behavior.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    key: Vec<u8>,
}

impl MessageCodec {
    /// Build a codec from a connection descriptor, rejecting signature
    /// schemes this implementation cannot produce.
    pub fn new(info: &ConnectionInfo) -> Result<Self> {
        if !info.key.is_empty() && info.signature_scheme != SIGNATURE_SCHEME {
            return Err(Error::Connection(format!(
                "unsupported signature scheme: {}",
                info.signature_scheme
            )));
        }
        Ok(Self::from_key(&info.key))
    }

    pub fn from_key(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    /// Encode a message into its multipart frame list.
    pub fn encode(&self, msg: &WireMessage) -> Result<Vec<Vec<u8>>> {
        let header = serde_json::to_vec(&msg.header)?;
        let parent = match &msg.parent_header {
            Some(parent) => serde_json::to_vec(parent)?,
            None => b"{}".to_vec(),
        };
        let metadata = serde_json::to_vec(&msg.metadata)?;
        let content = serde_json::to_vec(&msg.content)?;

        let signature = self.sign(&[&header, &parent, &metadata, &content])?;

        let mut frames = Vec::with_capacity(6 + msg.buffers.len());
        frames.push(DELIMITER.to_vec());
        frames.push(signature.into_bytes());
        frames.push(header);
        frames.push(parent);
        frames.push(metadata);
        frames.push(content);
        frames.extend(msg.buffers.iter().cloned());
        Ok(frames)
    }

    /// Decode a multipart frame list, verifying the signature first.
    ///
    /// A mismatched or malformed signature fails with
    /// [`Error::Authentication`] and nothing is parsed past it.
    pub fn decode(&self, frames: &[Vec<u8>]) -> Result<WireMessage> {
        let delim = frames
            .iter()
            .position(|f| f == DELIMITER)
            .ok_or_else(|| Error::Protocol("missing message delimiter frame".to_string()))?;

        let body = &frames[delim + 1..];
        if body.len() < 5 {
            return Err(Error::Protocol(format!(
                "truncated message: {} frames after delimiter, expected at least 5",
                body.len()
            )));
        }

        let signature = &body[0];
        let signed: [&[u8]; 4] = [&body[1], &body[2], &body[3], &body[4]];
        self.verify(signature, &signed)?;

        let header: MessageHeader = serde_json::from_slice(signed[0])
            .map_err(|e| Error::Protocol(format!("invalid message header: {}", e)))?;

        let parent_value: Value = serde_json::from_slice(signed[1])
            .map_err(|e| Error::Protocol(format!("invalid parent header: {}", e)))?;
        let parent_header = match parent_value {
            Value::Object(map) if map.is_empty() => None,
            value => Some(
                serde_json::from_value(value)
                    .map_err(|e| Error::Protocol(format!("invalid parent header: {}", e)))?,
            ),
        };

        let metadata: Map<String, Value> = serde_json::from_slice(signed[2])
            .map_err(|e| Error::Protocol(format!("invalid metadata: {}", e)))?;
        let content: Value = serde_json::from_slice(signed[3])
            .map_err(|e| Error::Protocol(format!("invalid content: {}", e)))?;

        Ok(WireMessage {
            header,
            parent_header,
            metadata,
            content,
            buffers: body[5..].to_vec(),
        })
    }

    /// Hex signature over the four JSON frames; empty when signing is
    /// disabled.
    fn sign(&self, parts: &[&[u8]; 4]) -> Result<String> {
        if self.key.is_empty() {
            return Ok(String::new());
        }
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Authentication(format!("invalid signing key: {}", e)))?;
        for part in parts {
            mac.update(part);
        }
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, signature: &[u8], parts: &[&[u8]; 4]) -> Result<()> {
        if self.key.is_empty() {
            return Ok(());
        }
        let provided = hex::decode(signature)
            .map_err(|_| Error::Authentication("signature is not valid hex".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Authentication(format!("invalid signing key: {}", e)))?;
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&provided)
            .map_err(|_| Error::Authentication("signature mismatch".to_string()))
    }
}
