//! Envelope framing and MessagePack encoding of message bodies.
//!
//! The overlay only ever sees [`Envelope`]s. The envelope keeps its type tag as a raw byte so that a message of an
//! unknown kind still decodes far enough to be routed and reported, instead of failing as an opaque decode error.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::CodecError,
    message::{MessageKind, ProtocolId},
};

/// A protocol-keyed, typed message as carried by the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Registration the message is addressed to.
    pub protocol_id: ProtocolId,
    /// Raw [`MessageKind`] tag.
    pub tag: u8,
    /// MessagePack encoded body.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Envelope {
    /// Encodes `body` and wraps it for `protocol_id`.
    pub fn seal<T>(protocol_id: ProtocolId, kind: MessageKind, body: &T) -> Result<Self, CodecError>
    where
        T: Serialize + ?Sized,
    {
        Ok(Envelope {
            protocol_id,
            tag: kind.tag(),
            body: encode(body)?,
        })
    }

    /// Returns the message kind, or the raw tag if it is not a known kind.
    pub fn kind(&self) -> Result<MessageKind, u8> {
        MessageKind::try_from(self.tag)
    }

    /// Decodes the body as `T`.
    pub fn open<T>(&self) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        decode(&self.body)
    }

    /// Serializes the whole envelope, for overlays that move raw bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }

    /// Deserializes an envelope produced by [`Envelope::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }
}

/// Serializes a value with named fields, so that bodies stay readable across struct changes.
pub fn encode<T>(value: &T) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + ?Sized,
{
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserializes a value produced by [`encode`].
pub fn decode<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned,
{
    Ok(rmp_serde::from_slice(bytes)?)
}
