//! Transfer filters: reversible byte transforms applied to message bodies.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

/// Id of the built-in gzip filter.
pub const GZIP_FILTER_ID: u8 = b'g';

/// A reversible body transform, e.g. compression.
pub trait XferFilter: Send + Sync + 'static {
    /// Single-byte id recorded in the message header.
    fn id(&self) -> u8;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Transform outgoing bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transform fails.
    fn on_pack(&self, src: Bytes) -> Result<Bytes>;

    /// Reverse [`XferFilter::on_pack`] on incoming bytes, producing at most
    /// `limit` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input was not produced by this filter, or
    /// [`Error::MessageTooLarge`] if the output would exceed `limit`.
    fn on_unpack(&self, src: Bytes, limit: usize) -> Result<Bytes>;
}

/// Gzip compression filter.
#[derive(Debug, Clone, Copy)]
pub struct GzipFilter {
    level: Compression,
}

impl GzipFilter {
    /// Create a filter with the given compression level (0-9).
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipFilter {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl XferFilter for GzipFilter {
    fn id(&self) -> u8 {
        GZIP_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn on_pack(&self, src: Bytes) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(src.len() / 2), self.level);
        encoder
            .write_all(&src)
            .and_then(|()| encoder.finish())
            .map(Bytes::from)
            .map_err(|e| Error::XferFailed {
                name: "gzip",
                reason: e.to_string(),
            })
    }

    fn on_unpack(&self, src: Bytes, limit: usize) -> Result<Bytes> {
        // One byte past the limit is enough to tell an oversized body apart.
        let bound = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
        let mut out = Vec::with_capacity(src.len().saturating_mul(2).min(limit));
        GzDecoder::new(&src[..])
            .take(bound)
            .read_to_end(&mut out)
            .map_err(|e| Error::XferFailed {
                name: "gzip",
                reason: e.to_string(),
            })?;
        check_limit(out.len(), limit)?;
        Ok(Bytes::from(out))
    }
}

fn check_limit(size: usize, limit: usize) -> Result<()> {
    if size > limit {
        return Err(Error::MessageTooLarge {
            size: size as u64,
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
        });
    }
    Ok(())
}

/// Immutable set of transfer filters, keyed by id.
#[derive(Clone)]
pub struct XferRegistry {
    filters: Arc<HashMap<u8, Arc<dyn XferFilter>>>,
}

impl XferRegistry {
    /// Registry holding only the gzip filter.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut filters: HashMap<u8, Arc<dyn XferFilter>> = HashMap::new();
        filters.insert(GZIP_FILTER_ID, Arc::new(GzipFilter::default()));
        Self {
            filters: Arc::new(filters),
        }
    }

    /// Returns a copy of this registry extended by `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already taken.
    pub fn with(&self, filter: Arc<dyn XferFilter>) -> Result<Self> {
        if self.filters.contains_key(&filter.id()) {
            return Err(Error::DuplicateXferFilter(filter.id()));
        }
        let mut filters = (*self.filters).clone();
        filters.insert(filter.id(), filter);
        Ok(Self {
            filters: Arc::new(filters),
        })
    }

    /// Look up a filter.
    ///
    /// # Errors
    ///
    /// Returns an error if no filter has this id.
    pub fn get(&self, id: u8) -> Result<&Arc<dyn XferFilter>> {
        self.filters.get(&id).ok_or(Error::UnknownXferFilter(id))
    }

    /// True if a filter with this id is registered.
    #[must_use]
    pub fn contains(&self, id: u8) -> bool {
        self.filters.contains_key(&id)
    }
}

impl Default for XferRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for XferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.filters.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("XferRegistry").field("ids", &ids).finish()
    }
}

/// Ordered chain of filter ids attached to one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XferPipe {
    ids: Vec<u8>,
}

impl XferPipe {
    /// Empty pipe.
    #[must_use]
    pub const fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Append filter ids to the end of the chain.
    pub fn append(&mut self, ids: &[u8]) {
        self.ids.extend_from_slice(ids);
    }

    /// Filter ids in packing order.
    #[must_use]
    pub fn ids(&self) -> &[u8] {
        &self.ids
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if no filter is applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remove all filters.
    pub fn reset(&mut self) {
        self.ids.clear();
    }

    /// Run `data` through every filter, first to last.
    ///
    /// # Errors
    ///
    /// Returns an error if a filter is unknown or fails.
    pub fn on_pack(&self, registry: &XferRegistry, mut data: Bytes) -> Result<Bytes> {
        for id in &self.ids {
            data = registry.get(*id)?.on_pack(data)?;
        }
        Ok(data)
    }

    /// Undo [`XferPipe::on_pack`], last filter first, never holding more
    /// than `limit` bytes of output.
    ///
    /// # Errors
    ///
    /// Returns an error if a filter is unknown or fails, or
    /// [`Error::MessageTooLarge`] if any stage exceeds `limit`.
    pub fn on_unpack(
        &self,
        registry: &XferRegistry,
        mut data: Bytes,
        limit: usize,
    ) -> Result<Bytes> {
        check_limit(data.len(), limit)?;
        for id in self.ids.iter().rev() {
            data = registry.get(*id)?.on_unpack(data, limit)?;
            check_limit(data.len(), limit)?;
        }
        Ok(data)
    }
}
