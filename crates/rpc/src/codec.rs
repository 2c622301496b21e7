//! Body codecs.
//!
//! Bodies are carried around type-erased as [`serde_value::Value`], so a codec
//! only needs to translate between that value and bytes. This keeps the
//! [`Codec`] trait object-safe and lets the registry be keyed by the single
//! byte that travels in every message header.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_value::Value;

use crate::error::{Error, Result};

/// Codec id meaning "no codec"; such bodies are always raw bytes.
pub const NIL_CODEC_ID: u8 = 0;

/// Id of the built-in JSON codec.
pub const JSON_CODEC_ID: u8 = b'j';

/// Id of the built-in CBOR codec.
pub const CBOR_CODEC_ID: u8 = b'c';

/// A body encoding.
pub trait Codec: Send + Sync + 'static {
    /// Single-byte id carried in the message header.
    fn id(&self) -> u8;

    /// Unique, human-readable name.
    fn name(&self) -> &'static str;

    /// Encode a body value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn marshal(&self, value: &Value) -> Result<Bytes>;

    /// Decode bytes into a body value.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid for this codec.
    fn unmarshal(&self, data: &[u8]) -> Result<Value>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        JSON_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| Error::SerializationFailed(e.to_string()))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        serde_json::from_slice(data).map_err(|e| Error::DeserializationFailed(e.to_string()))
    }
}

/// CBOR codec backed by `ciborium`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn id(&self) -> u8 {
        CBOR_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "cbor"
    }

    fn marshal(&self, value: &Value) -> Result<Bytes> {
        let mut vec = Vec::new();
        ciborium::ser::into_writer(value, &mut vec)
            .map_err(|e| Error::SerializationFailed(e.to_string()))?;
        Ok(Bytes::from(vec))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        ciborium::de::from_reader(data).map_err(|e| Error::DeserializationFailed(e.to_string()))
    }
}

/// Immutable set of codecs, looked up by id or by name.
#[derive(Clone)]
pub struct CodecRegistry {
    by_id: Arc<HashMap<u8, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// Registry holding only the built-in JSON and CBOR codecs.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut by_id: HashMap<u8, Arc<dyn Codec>> = HashMap::new();
        by_id.insert(JSON_CODEC_ID, Arc::new(JsonCodec));
        by_id.insert(CBOR_CODEC_ID, Arc::new(CborCodec));
        Self {
            by_id: Arc::new(by_id),
        }
    }

    /// Returns a copy of this registry extended by `codec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is [`NIL_CODEC_ID`] or the id or name is
    /// already taken.
    pub fn with(&self, codec: Arc<dyn Codec>) -> Result<Self> {
        if codec.id() == NIL_CODEC_ID || self.by_id.contains_key(&codec.id()) {
            return Err(Error::DuplicateCodec(format!("id {:#04x}", codec.id())));
        }
        if self.by_name(codec.name()).is_ok() {
            return Err(Error::DuplicateCodec(codec.name().to_string()));
        }
        let mut by_id = (*self.by_id).clone();
        by_id.insert(codec.id(), codec);
        Ok(Self {
            by_id: Arc::new(by_id),
        })
    }

    /// Look up a codec by header id.
    ///
    /// # Errors
    ///
    /// Returns an error if no codec has this id.
    pub fn get(&self, id: u8) -> Result<&Arc<dyn Codec>> {
        self.by_id.get(&id).ok_or(Error::UnknownCodec(id))
    }

    /// Look up a codec by name.
    ///
    /// # Errors
    ///
    /// Returns an error if no codec has this name.
    pub fn by_name(&self, name: &str) -> Result<&Arc<dyn Codec>> {
        self.by_id
            .values()
            .find(|c| c.name() == name)
            .ok_or_else(|| Error::UnknownCodecName(name.to_string()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_id.values().map(|c| c.name()).collect();
        names.sort_unstable();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}
