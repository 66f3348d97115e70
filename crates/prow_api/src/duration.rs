//! Duration codec for decoration configs.
//!
//! Older records store durations as integer nanoseconds; newer ones use
//! human-readable strings (`"30m"`, `"1h30m"`). Decoding accepts both,
//! encoding always emits strings. Implementers must not reject integers
//! from older records.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde adapter for `Option<Duration>` fields.
///
/// Use as `#[serde(with = "crate::duration::option")]`.
pub mod option {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Nanos(u64),
        Text(String),
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Raw>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(Raw::Nanos(nanos)) => Ok(Some(Duration::from_nanos(nanos))),
            Some(Raw::Text(text)) => humantime::parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
