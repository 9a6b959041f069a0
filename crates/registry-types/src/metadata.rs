//! Instance metadata
//!
//! A string map with a deterministic encoding (sorted keys) so that two
//! metadata values compare equal exactly when their encodings do. Carries the
//! typed accessor for the reserved heartbeat-interval key.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reserved metadata key holding the heartbeat period as a duration string.
pub const HEART_BEAT_INTERVAL_KEY: &str = "preserved.heart.beat.interval";

/// Heartbeat period used when the metadata does not override it.
pub const DEFAULT_HEART_BEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Free-form instance metadata (string to string, unordered).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic JSON encoding; keys come out sorted.
    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Heartbeat period from `preserved.heart.beat.interval`, falling back to
    /// the default when the key is absent or unparseable.
    pub fn heart_beat_interval(&self) -> Duration {
        self.get(HEART_BEAT_INTERVAL_KEY)
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_HEART_BEAT_INTERVAL)
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(m: BTreeMap<String, String>) -> Self {
        Self(m)
    }
}

/// Parse a duration string of the form `<number><unit>` with unit one of
/// `ns`, `us`, `ms`, `s`, `m`, `h`. A bare number is taken as milliseconds.
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let nanos = match unit {
        "ns" => value,
        "us" | "µs" => value * 1e3,
        "ms" | "" => value * 1e6,
        "s" => value * 1e9,
        "m" => value * 60.0 * 1e9,
        "h" => value * 3600.0 * 1e9,
        _ => return None,
    };
    Some(Duration::from_nanos(nanos as u64))
}
