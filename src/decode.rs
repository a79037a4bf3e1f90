//! Body decoders used by the `Decoded<T>` extraction path.

use std::any::type_name;

use serde::de::DeserializeOwned;

use crate::BoxError;

/// A successful body could not be turned into the declared type.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode response body into {target}: {source}")]
pub struct DecodeError {
    target: &'static str,
    #[source]
    source: BoxError,
}

impl DecodeError {
    pub fn new<T: ?Sized>(source: impl Into<BoxError>) -> Self {
        Self {
            target: type_name::<T>(),
            source: source.into(),
        }
    }

    /// Name of the type the body was being decoded into.
    pub fn target(&self) -> &'static str {
        self.target
    }
}

pub trait Decoder: Send + Sync + 'static {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError>;
}

/// JSON decoder backed by `sonic-rs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SonicDecoder;

impl Decoder for SonicDecoder {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError> {
        sonic_rs::from_slice(body).map_err(|err| DecodeError::new::<T>(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Pair {
        a: u32,
    }

    #[test]
    fn sonic_decoder_reads_json() {
        let pair: Pair = SonicDecoder.decode(br#"{"a":1}"#).expect("valid json");
        assert_eq!(pair, Pair { a: 1 });
    }

    #[test]
    fn decode_error_names_the_target_type() {
        let err = SonicDecoder
            .decode::<Pair>(b"not-json")
            .expect_err("malformed body should fail");
        assert!(err.target().ends_with("Pair"));
        assert!(err.to_string().contains("Pair"));
    }
}
