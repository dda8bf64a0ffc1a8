//! De-/serialization functions for `std::time::Duration` objects.

/// De-/serialization functions for `Duration` objects represented as
/// milliseconds, for use with `#[serde(with = "...")]`.
pub mod ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a `Duration` to an integer representing milliseconds.
    ///
    /// Errors if the duration is larger than `u64::MAX` milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: u64 = duration
            .as_millis()
            .try_into()
            .map_err(|_| serde::ser::Error::custom("duration as milliseconds overflows u64"))?;
        serializer.serialize_u64(millis)
    }

    /// Deserializes an integer representing milliseconds into a `Duration`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

}
