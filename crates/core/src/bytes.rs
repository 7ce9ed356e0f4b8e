//! Serde adapter for byte strings embedded in JSON documents.
//!
//! Test-case contents and checkpoint prefixes are arbitrary byte strings, so
//! they travel through JSON as base64 (`#[serde(with = "ojc_core::bytes")]`).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&B64.encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    B64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
}
