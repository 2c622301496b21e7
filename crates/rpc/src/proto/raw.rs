//! Length-prefixed binary framing with a CRC32 checksum.
//!
//! ```text
//! u32 len | u32 crc32 | u8 version | u8 xfer_count, ids.. | i32 seq | u8 mtype
//! | u16 len, service_method | u16 len, status | u16 len, meta | u8 body_codec
//! | body
//! ```
//!
//! All integers are big-endian. `len` counts the bytes after the checksum and
//! the checksum covers exactly those bytes. An empty status block means OK.
//! Metadata entries are `u16 klen, key, u32 vlen, value`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Proto, WireContext};
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use crate::status::Status;

/// Version byte written by [`RawProto`].
pub const RAW_PROTO_VERSION: u8 = 6;

/// Length and checksum prefix.
const FRAME_PREFIX_SIZE: usize = 8;

/// Fixed bytes after the prefix: version, xfer count, seq, mtype, three u16
/// lengths and the codec id.
const FIXED_HEADER_SIZE: usize = 1 + 1 + 4 + 1 + 2 + 2 + 2 + 1;

/// The built-in binary protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawProto;

impl RawProto {
    /// Create the protocol.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Proto for RawProto {
    fn version(&self) -> (u8, &'static str) {
        (RAW_PROTO_VERSION, "raw")
    }

    fn pack(&self, msg: &mut Message, ctx: &WireContext, dst: &mut BytesMut) -> Result<()> {
        let body = msg
            .xfer_pipe()
            .on_pack(&ctx.xfers, msg.marshal_body(&ctx.codecs)?)?;
        let status = match msg.status() {
            Some(status) if !status.is_ok() => status
                .to_header_bytes()
                .map_err(|e| Error::SerializationFailed(e.to_string()))?,
            _ => Vec::new(),
        };
        let meta = encode_meta(msg)?;
        let xfer_ids = msg.xfer_pipe().ids();
        let xfer_count = u8::try_from(xfer_ids.len())
            .map_err(|_| Error::InvalidFrame(format!("{} transfer filters", xfer_ids.len())))?;
        let service_method = msg.service_method().as_bytes();
        let service_method_len = u16_len(service_method.len(), "service method")?;
        let status_len = u16_len(status.len(), "status")?;
        let meta_len = u16_len(meta.len(), "metadata")?;

        let payload_len = FIXED_HEADER_SIZE
            + xfer_ids.len()
            + service_method.len()
            + status.len()
            + meta.len()
            + body.len();
        let frame_len = FRAME_PREFIX_SIZE + payload_len;
        msg.set_size(frame_len)?;
        let payload_len = u32::try_from(payload_len).map_err(|_| Error::MessageTooLarge {
            size: frame_len as u64,
            limit: msg.size_limit(),
        })?;

        dst.reserve(frame_len);
        let start = dst.len();
        dst.put_u32(payload_len);
        dst.put_u32(0);
        dst.put_u8(RAW_PROTO_VERSION);
        dst.put_u8(xfer_count);
        dst.put_slice(msg.xfer_pipe().ids());
        dst.put_i32(msg.seq());
        dst.put_u8(msg.mtype() as u8);
        dst.put_u16(service_method_len);
        dst.put_slice(msg.service_method().as_bytes());
        dst.put_u16(status_len);
        dst.put_slice(&status);
        dst.put_u16(meta_len);
        dst.put_slice(&meta);
        dst.put_u8(msg.body_codec());
        dst.put_slice(&body);

        let checksum = crc32fast::hash(&dst[start + FRAME_PREFIX_SIZE..]);
        dst[start + 4..start + FRAME_PREFIX_SIZE].copy_from_slice(&checksum.to_be_bytes());
        Ok(())
    }

    fn unpack(&self, src: &mut BytesMut, ctx: &WireContext, msg: &mut Message) -> Result<bool> {
        if src.len() < FRAME_PREFIX_SIZE {
            return Ok(false);
        }

        let mut prefix = &src[..FRAME_PREFIX_SIZE];
        let payload_len = prefix.get_u32() as usize;
        let expected = prefix.get_u32();

        // Reject oversized frames before buffering them.
        let frame_len = FRAME_PREFIX_SIZE + payload_len;
        msg.set_size(frame_len)?;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(false);
        }

        src.advance(FRAME_PREFIX_SIZE);
        let mut frame = src.split_to(payload_len).freeze();
        let actual = crc32fast::hash(&frame);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let version = read_u8(&mut frame, "version")?;
        if version != RAW_PROTO_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported raw protocol version: {version}"
            )));
        }

        let xfer_count = read_u8(&mut frame, "transfer filter count")? as usize;
        let xfer_ids = take(&mut frame, xfer_count, "transfer filter ids")?;
        msg.xfer_pipe_mut().reset();
        msg.xfer_pipe_mut().append(&xfer_ids);

        ensure(&frame, 5, "seq and type")?;
        msg.set_seq(frame.get_i32());
        msg.set_mtype(MessageType::try_from(frame.get_u8())?);

        let service_method = take_u16_prefixed(&mut frame, "service method")?;
        let service_method = std::str::from_utf8(&service_method)
            .map_err(|e| Error::InvalidFrame(format!("Service method is not UTF-8: {e}")))?;
        msg.set_service_method(service_method);

        let status = take_u16_prefixed(&mut frame, "status")?;
        let status = if status.is_empty() {
            Status::ok()
        } else {
            Status::from_header_bytes(&status)
                .map_err(|e| Error::DeserializationFailed(e.to_string()))?
        };
        msg.set_status(Some(status));

        let meta = take_u16_prefixed(&mut frame, "metadata")?;
        decode_meta(meta, msg)?;

        msg.set_body_codec(read_u8(&mut frame, "body codec")?);
        // Filters may inflate the body; the decoded message obeys the same limit.
        let limit = msg.size_limit();
        let header_len = frame_len - frame.len();
        let budget = usize::try_from(limit)
            .unwrap_or(usize::MAX)
            .saturating_sub(header_len);
        let body = msg
            .xfer_pipe()
            .on_unpack(&ctx.xfers, frame, budget)
            .map_err(|e| match e {
                Error::MessageTooLarge { size, .. } => Error::MessageTooLarge {
                    size: size.saturating_add(header_len as u64),
                    limit,
                },
                other => other,
            })?;
        msg.unmarshal_body(body, &ctx.codecs)?;
        Ok(true)
    }
}

fn u16_len(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| Error::InvalidFrame(format!("{what} is {len} bytes, limit is 65535")))
}

fn encode_meta(msg: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for (key, value) in msg.meta() {
        let klen = u16::try_from(key.len()).map_err(|_| Error::MetaTooLarge(key.len()))?;
        let vlen = u32::try_from(value.len()).map_err(|_| Error::MetaTooLarge(value.len()))?;
        out.put_u16(klen);
        out.put_slice(key.as_bytes());
        out.put_u32(vlen);
        out.put_slice(value);
        if out.len() > usize::from(u16::MAX) {
            return Err(Error::MetaTooLarge(out.len()));
        }
    }
    Ok(out)
}

fn decode_meta(mut block: Bytes, msg: &mut Message) -> Result<()> {
    msg.meta_mut().clear();
    while block.has_remaining() {
        ensure(&block, 2, "metadata key length")?;
        let klen = block.get_u16() as usize;
        let key = take(&mut block, klen, "metadata key")?;
        let key = String::from_utf8(key.to_vec())
            .map_err(|e| Error::InvalidFrame(format!("Metadata key is not UTF-8: {e}")))?;
        ensure(&block, 4, "metadata value length")?;
        let vlen = block.get_u32() as usize;
        let value = take(&mut block, vlen, "metadata value")?;
        msg.meta_mut().insert(key, value);
    }
    Ok(())
}

fn ensure(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::InvalidFrame(format!(
            "Truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    ensure(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn take(buf: &mut Bytes, n: usize, what: &str) -> Result<Bytes> {
    ensure(buf, n, what)?;
    Ok(buf.split_to(n))
}

fn take_u16_prefixed(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    ensure(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    take(buf, len, what)
}
