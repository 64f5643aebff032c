//! Version-keyed decoder tables.
//!
//! Every entity layout that ever shipped keeps a decoder, registered under
//! the format version that introduced it. A stream stamped with version `v`
//! is decoded by the layout with the greatest introducing version `<= v`,
//! so adding a field means adding a layout, never editing an old one.

use std::collections::BTreeMap;

use crate::serialize::DeserializeError;

/// Decodes one layout's payload bytes with a resolution context.
pub type Decoder<T, C> = fn(&[u8], &C) -> Result<T, DeserializeError>;

/// Registry of decoders keyed by the format version that introduced each
/// layout.
pub struct DecodeTable<T, C> {
    decoders: BTreeMap<u32, Decoder<T, C>>,
}

impl<T, C> DecodeTable<T, C> {
    pub fn new() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    /// Register the decoder for the layout introduced in `version`.
    pub fn with(mut self, version: u32, decoder: Decoder<T, C>) -> Self {
        self.decoders.insert(version, decoder);
        self
    }

    /// The layout a stream at `version` was written with, if any.
    pub fn layout_for(&self, version: u32) -> Option<u32> {
        self.decoders.range(..=version).next_back().map(|(v, _)| *v)
    }

    /// Whether some layout can read a stream at `version`.
    pub fn can_decode(&self, version: u32) -> bool {
        self.layout_for(version).is_some()
    }

    /// Decode `payload` written at `version`.
    pub fn decode(&self, version: u32, payload: &[u8], ctx: &C) -> Result<T, DeserializeError> {
        let (_, decoder) = self
            .decoders
            .range(..=version)
            .next_back()
            .ok_or(DeserializeError::UnsupportedVersion(version))?;
        decoder(payload, ctx)
    }

    /// Introducing versions of every registered layout, ascending.
    pub fn layouts(&self) -> impl Iterator<Item = u32> + '_ {
        self.decoders.keys().copied()
    }

    pub fn layout_count(&self) -> usize {
        self.decoders.len()
    }
}

impl<T, C> Default for DecodeTable<T, C> {
    fn default() -> Self {
        Self::new()
    }
}
