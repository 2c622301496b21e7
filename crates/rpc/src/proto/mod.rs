//! Wire protocols.
//!
//! A [`Proto`] turns a [`Message`] into bytes and back. The endpoint never
//! depends on a concrete layout: each connection gets its own instance from a
//! [`ProtoFunc`], so sessions on one endpoint may speak different formats.

mod raw;

use std::sync::Arc;

use bytes::BytesMut;

use crate::codec::CodecRegistry;
use crate::error::Result;
use crate::message::Message;
use crate::xfer::XferRegistry;

pub use raw::{RAW_PROTO_VERSION, RawProto};

/// Factory binding a protocol instance to a new connection.
pub type ProtoFunc = Arc<dyn Fn() -> Arc<dyn Proto> + Send + Sync>;

/// Registries a protocol needs to encode and decode bodies.
#[derive(Debug, Clone, Default)]
pub struct WireContext {
    /// Body codecs.
    pub codecs: CodecRegistry,
    /// Transfer filters.
    pub xfers: XferRegistry,
}

/// A message framing format.
pub trait Proto: Send + Sync + 'static {
    /// Protocol version byte and name.
    fn version(&self) -> (u8, &'static str);

    /// Append one encoded frame for `msg` to `dst`, recording its size.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded or exceeds its size
    /// limit; `dst` may then hold a partial frame and must be discarded.
    fn pack(&self, msg: &mut Message, ctx: &WireContext, dst: &mut BytesMut) -> Result<()>;

    /// Decode one frame from the front of `src` into `msg`.
    ///
    /// Returns `Ok(false)`, leaving `src` untouched, while the frame is still
    /// incomplete.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered frame is malformed; the stream is then
    /// desynchronized.
    fn unpack(&self, src: &mut BytesMut, ctx: &WireContext, msg: &mut Message) -> Result<bool>;
}

/// The default [`ProtoFunc`], producing [`RawProto`].
#[must_use]
pub fn raw_proto_func() -> ProtoFunc {
    let proto: Arc<dyn Proto> = Arc::new(RawProto::new());
    Arc::new(move || Arc::clone(&proto))
}
