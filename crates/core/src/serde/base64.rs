//! Transparent base64 encoding / decoding as part of (de)serialization.

use std::fmt;

use base64::{
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose},
    Engine,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A wrapper around `Vec<u8>` that (de)serializes from / to an unpadded
/// base64 string using the standard character set.
///
/// Decoding allows trailing bits and accepts both padded and unpadded input
/// for maximum compatibility.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Base64 {
    bytes: Vec<u8>,
}

const ENGINE: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    general_purpose::NO_PAD
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

impl Base64 {
    /// Create a `Base64` instance from raw bytes, to be base64-encoded in
    /// serialization.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Parse some base64-encoded data to create a `Base64` instance.
    pub fn parse(encoded: impl AsRef<[u8]>) -> Result<Self, Base64DecodeError> {
        ENGINE
            .decode(encoded)
            .map(Self::new)
            .map_err(Base64DecodeError)
    }

    /// Get a reference to the raw bytes held by this `Base64` instance.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the raw bytes held by this `Base64` instance.
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    /// Encode the bytes contained in this `Base64` instance to unpadded
    /// base64.
    pub fn encode(&self) -> String {
        ENGINE.encode(&self.bytes)
    }
}

impl fmt::Debug for Base64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Display for Base64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Base64 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Base64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::parse(&encoded).map_err(de::Error::custom)
    }
}

/// An error that occurred while decoding a base64 string.
#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid base64: {0}")]
pub struct Base64DecodeError(#[source] base64::DecodeError);

#[cfg(test)]
mod tests {
    use super::Base64;

    #[test]
    fn decode_encode_round_trip_preserves_bytes() {
        let base64 = Base64::parse("dGVzdCBtZXNzYWdl").unwrap();
        assert_eq!(base64.as_bytes(), b"test message");
        assert_eq!(base64.encode(), "dGVzdCBtZXNzYWdl");
    }

    #[test]
    fn decode_padded_input() {
        // Padding must be tolerated even though we emit unpadded output.
        let base64 = Base64::parse("dGVzdA==").unwrap();
        assert_eq!(base64.encode(), "dGVzdA");
    }

    #[test]
    fn decode_invalid_input() {
        assert!(Base64::parse("not base64!").is_err());
    }
}
