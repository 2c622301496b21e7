//! The header+body envelope exchanged over a connection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_value::Value;

use crate::codec::{CodecRegistry, NIL_CODEC_ID};
use crate::error::{Error, Result};
use crate::pool::Recycle;
use crate::status::Status;
use crate::xfer::XferPipe;

/// Ordered message metadata.
pub type Meta = IndexMap<String, Bytes>;

/// Decides, once the header is known, how an inbound body is materialised.
pub type NewBodyFn = Arc<dyn Fn(&Message) -> BodyKind + Send + Sync>;

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Request expecting exactly one reply.
    Call = 0x01,
    /// Response correlated to a call by sequence number.
    Reply = 0x02,
    /// One-way message.
    Push = 0x03,
}

impl MessageType {
    /// Upper-case wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Reply => "REPLY",
            Self::Push => "PUSH",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Call),
            0x02 => Ok(Self::Reply),
            0x03 => Ok(Self::Push),
            _ => Err(Error::InvalidFrame(format!(
                "Unknown message type: {value:#x}"
            ))),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Encoded bytes, passed through the codec untouched.
    Raw(Bytes),
    /// Structured value, encoded with the message's body codec.
    Value(Value),
}

impl Body {
    /// True for [`Body::Empty`].
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// What a [`NewBodyFn`] asks the decoder to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Keep the encoded bytes; decode lazily.
    Raw,
    /// Decode into a [`Value`] right away.
    Decoded,
}

/// A pooled, reusable protocol message.
pub struct Message {
    seq: i32,
    mtype: MessageType,
    service_method: String,
    status: Option<Status>,
    meta: Meta,
    body_codec: u8,
    body: Body,
    xfer_pipe: XferPipe,
    size: u32,
    size_limit: u32,
    new_body: Option<NewBodyFn>,
}

impl Message {
    /// Empty CALL message bounded by `size_limit` bytes on the wire.
    #[must_use]
    pub fn new(size_limit: u32) -> Self {
        Self {
            seq: 0,
            mtype: MessageType::Call,
            service_method: String::new(),
            status: None,
            meta: Meta::new(),
            body_codec: NIL_CODEC_ID,
            body: Body::Empty,
            xfer_pipe: XferPipe::new(),
            size: 0,
            size_limit,
            new_body: None,
        }
    }

    /// Sequence number pairing a CALL with its REPLY.
    #[must_use]
    pub const fn seq(&self) -> i32 {
        self.seq
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: i32) {
        self.seq = seq;
    }

    /// Message type.
    #[must_use]
    pub const fn mtype(&self) -> MessageType {
        self.mtype
    }

    /// Set the message type.
    pub fn set_mtype(&mut self, mtype: MessageType) {
        self.mtype = mtype;
    }

    /// Routable service-method path.
    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Set the service-method path.
    pub fn set_service_method(&mut self, service_method: &str) {
        self.service_method.clear();
        self.service_method.push_str(service_method);
    }

    /// Header status; `None` only on messages that were never decoded.
    #[must_use]
    pub const fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Set the header status.
    pub fn set_status(&mut self, status: Option<Status>) {
        self.status = status;
    }

    /// Metadata, in insertion order.
    #[must_use]
    pub const fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Mutable metadata.
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }

    /// Id of the body codec.
    #[must_use]
    pub const fn body_codec(&self) -> u8 {
        self.body_codec
    }

    /// Set the body codec id.
    pub fn set_body_codec(&mut self, id: u8) {
        self.body_codec = id;
    }

    /// Current body.
    #[must_use]
    pub const fn body(&self) -> &Body {
        &self.body
    }

    /// Swap in a new body, returning the old one.
    pub fn replace_body(&mut self, body: Body) -> Body {
        std::mem::replace(&mut self.body, body)
    }

    /// Serialize `value` into a structured body.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn set_body<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.body = Body::Value(serde_value::to_value(value)?);
        Ok(())
    }

    /// Set an already-encoded body.
    pub fn set_raw_body(&mut self, data: Bytes) {
        self.body = Body::Raw(data);
    }

    /// Transfer filters applied to the body.
    #[must_use]
    pub const fn xfer_pipe(&self) -> &XferPipe {
        &self.xfer_pipe
    }

    /// Mutable transfer pipe.
    pub fn xfer_pipe_mut(&mut self) -> &mut XferPipe {
        &mut self.xfer_pipe
    }

    /// Size of the whole frame, as last packed or unpacked.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Largest frame this message may be packed into or unpacked from.
    #[must_use]
    pub const fn size_limit(&self) -> u32 {
        self.size_limit
    }

    /// Record the frame size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if `size` exceeds the size limit.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        match u32::try_from(size) {
            Ok(n) if n <= self.size_limit => {
                self.size = n;
                Ok(())
            }
            _ => Err(Error::MessageTooLarge {
                size: size as u64,
                limit: self.size_limit,
            }),
        }
    }

    /// Install the hook consulted by [`Message::unmarshal_body`].
    pub fn set_new_body(&mut self, new_body: Option<NewBodyFn>) {
        self.new_body = new_body;
    }

    /// Encode the body with the codec named by `body_codec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is unknown or fails.
    pub fn marshal_body(&self, codecs: &CodecRegistry) -> Result<Bytes> {
        match &self.body {
            Body::Empty => Ok(Bytes::new()),
            Body::Raw(data) => Ok(data.clone()),
            Body::Value(value) => codecs.get(self.body_codec)?.marshal(value),
        }
    }

    /// Populate the body from encoded bytes; the header must already be set.
    ///
    /// # Errors
    ///
    /// Returns an error if eager decoding was requested and failed.
    pub fn unmarshal_body(&mut self, data: Bytes, codecs: &CodecRegistry) -> Result<()> {
        if data.is_empty() {
            self.body = Body::Empty;
            return Ok(());
        }
        let kind = self
            .new_body
            .as_ref()
            .map_or(BodyKind::Raw, |new_body| new_body(self));
        self.body = match kind {
            BodyKind::Decoded if self.body_codec != NIL_CODEC_ID => {
                Body::Value(codecs.get(self.body_codec)?.unmarshal(&data)?)
            }
            _ => Body::Raw(data),
        };
        Ok(())
    }

    /// Deserialize the body into `T`.
    ///
    /// An empty body decodes as unit, so `()` and `Option<T>` accept it.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is unknown or the body does not fit `T`.
    pub fn decode_body<T: DeserializeOwned>(&self, codecs: &CodecRegistry) -> Result<T> {
        let value = match &self.body {
            Body::Empty => Value::Unit,
            Body::Raw(data) if self.body_codec == NIL_CODEC_ID => Value::Bytes(data.to_vec()),
            Body::Raw(data) => codecs.get(self.body_codec)?.unmarshal(data)?,
            Body::Value(value) => value.clone(),
        };
        Ok(value.deserialize_into()?)
    }

    /// One-line rendering of metadata and body for trace output.
    pub(crate) fn detail(&self) -> String {
        let meta: Vec<_> = self
            .meta
            .iter()
            .map(|(k, v)| format!("{k}={}", String::from_utf8_lossy(v)))
            .collect();
        let body = match &self.body {
            Body::Empty => String::new(),
            Body::Raw(data) => String::from_utf8_lossy(data).into_owned(),
            Body::Value(value) => format!("{value:?}"),
        };
        format!("meta=[{}] body={body}", meta.join(", "))
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl Recycle for Message {
    fn recycle(&mut self) {
        self.seq = 0;
        self.mtype = MessageType::Call;
        self.service_method.clear();
        self.status = None;
        self.meta.clear();
        self.body_codec = NIL_CODEC_ID;
        self.body = Body::Empty;
        self.xfer_pipe.reset();
        self.size = 0;
        self.new_body = None;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("seq", &self.seq)
            .field("mtype", &self.mtype)
            .field("service_method", &self.service_method)
            .field("status", &self.status)
            .field("meta", &self.meta)
            .field("body_codec", &self.body_codec)
            .field("body", &self.body)
            .field("xfer_pipe", &self.xfer_pipe)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CBOR_CODEC_ID, JSON_CODEC_ID};
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i64,
        y: i64,
        label: String,
    }

    fn roundtrip<T>(codec: u8, value: &T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let codecs = CodecRegistry::with_defaults();
        let mut out = Message::default();
        out.set_body_codec(codec);
        out.set_body(value).unwrap();
        let data = out.marshal_body(&codecs).unwrap();

        let mut input = Message::default();
        input.set_body_codec(codec);
        input.unmarshal_body(data, &codecs).unwrap();
        input.decode_body(&codecs).unwrap()
    }

    #[test]
    fn test_body_roundtrip_shapes() {
        let point = Point {
            x: -3,
            y: 9,
            label: "p".to_string(),
        };
        let map = BTreeMap::from([("a".to_string(), 1u32), ("b".to_string(), 2)]);
        let list = vec![1i32, 2, 3, 4, 5];
        for codec in [JSON_CODEC_ID, CBOR_CODEC_ID] {
            assert_eq!(roundtrip(codec, &point), point);
            assert_eq!(roundtrip(codec, &map), map);
            assert_eq!(roundtrip(codec, &list), list);
            assert_eq!(roundtrip(codec, &15i64), 15);
            assert_eq!(roundtrip(codec, &"text".to_string()), "text");
        }
    }

    #[test]
    fn test_raw_body_passes_through() {
        let codecs = CodecRegistry::with_defaults();
        let mut msg = Message::default();
        msg.set_body_codec(JSON_CODEC_ID);
        msg.set_raw_body(Bytes::from_static(b"[1,2]"));
        assert_eq!(msg.marshal_body(&codecs).unwrap(), Bytes::from_static(b"[1,2]"));
        assert_eq!(msg.decode_body::<Vec<u8>>(&codecs).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_new_body_fn_selects_eager_decoding() {
        let codecs = CodecRegistry::with_defaults();
        let mut msg = Message::default();
        msg.set_body_codec(JSON_CODEC_ID);
        msg.set_service_method("/eager");
        msg.set_new_body(Some(Arc::new(|m: &Message| {
            if m.service_method() == "/eager" {
                BodyKind::Decoded
            } else {
                BodyKind::Raw
            }
        })));
        msg.unmarshal_body(Bytes::from_static(b"42"), &codecs).unwrap();
        assert!(matches!(msg.body(), Body::Value(_)));

        msg.set_service_method("/lazy");
        msg.unmarshal_body(Bytes::from_static(b"42"), &codecs).unwrap();
        assert!(matches!(msg.body(), Body::Raw(_)));
        assert_eq!(msg.decode_body::<u8>(&codecs).unwrap(), 42);
    }

    #[test]
    fn test_size_limit_is_enforced() {
        let mut msg = Message::new(16);
        msg.set_size(16).unwrap();
        assert_eq!(msg.size(), 16);
        assert!(matches!(
            msg.set_size(17),
            Err(Error::MessageTooLarge { size: 17, limit: 16 })
        ));
        assert_eq!(msg.size(), 16);
    }

    #[test]
    fn test_recycle_clears_everything_but_limit() {
        let mut msg = Message::new(64);
        msg.set_seq(7);
        msg.set_mtype(MessageType::Reply);
        msg.set_service_method("/a/b");
        msg.set_status(Some(Status::internal("boom")));
        msg.meta_mut().insert("k".to_string(), Bytes::from_static(b"v"));
        msg.set_body_codec(JSON_CODEC_ID);
        msg.set_body(&1u8).unwrap();
        msg.xfer_pipe_mut().append(&[b'g']);
        msg.set_size(10).unwrap();

        msg.recycle();
        assert_eq!(msg.seq(), 0);
        assert_eq!(msg.mtype(), MessageType::Call);
        assert!(msg.service_method().is_empty());
        assert!(msg.status().is_none());
        assert!(msg.meta().is_empty());
        assert_eq!(msg.body_codec(), NIL_CODEC_ID);
        assert!(msg.body().is_empty());
        assert!(msg.xfer_pipe().is_empty());
        assert_eq!(msg.size(), 0);
        assert_eq!(msg.size_limit(), 64);
    }

    #[test]
    fn test_message_type_from_byte() {
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Reply);
        assert!(MessageType::try_from(9).is_err());
        assert_eq!(MessageType::Push.to_string(), "PUSH");
    }
}
