// crates/resilience/src/serde_duration.rs
//! Serde helpers encoding durations as integer milliseconds
//!
//! Used as `#[serde(with = "crate::serde_duration")]` on config fields so
//! policies read naturally in TOML and JSON (`timeout = 30000`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Same encoding for maps of named durations
pub mod map {
    use super::*;

    pub fn serialize<S>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: HashMap<&str, u64> = map
            .iter()
            .map(|(k, v)| (k.as_str(), u64::try_from(v.as_millis()).unwrap_or(u64::MAX)))
            .collect();
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = HashMap::<String, u64>::deserialize(deserializer)?;
        Ok(millis
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}
