//! Conversion between application values and opaque message payloads.

use serde::{de::DeserializeOwned, Serialize};

use crate::{error::Error, Result};

/// Bidirectional, lossless conversion between application values and payload
/// bytes.
///
/// The broker preserves message boundaries, so codecs do not need to frame
/// their output. Implementations must be lossless for the value domain the
/// application uses: `decode(encode(v))` must reproduce `v`.
pub trait Codec: Send + Sync {
    /// Encodes a value into payload bytes.
    ///
    /// # Errors
    /// Returns [`Error::Encode`] if the value cannot be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decodes payload bytes into a value.
    ///
    /// # Errors
    /// Returns [`Error::Decode`] if the payload is not a valid encoding of
    /// the requested type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// The default codec: JSON via `serde_json`.
///
/// Binary-safe at the transport level (payloads are opaque bytes to the
/// broker) and lossless for the `serde` data model.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.into()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| Error::Decode(e.into()))
    }
}
