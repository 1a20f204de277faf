//! Cache entry and its on-store encoding

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A produced result plus the metadata needed to judge its freshness.
///
/// Entries are immutable once stored; a refresh writes a whole new entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  #[serde(rename = "data")]
  pub payload: String,
  /// Unix milliseconds at production time
  #[serde(rename = "timestamp")]
  pub created_at: i64,
  #[serde(default)]
  pub tags: Vec<String>,
}

impl CacheEntry {
  pub fn new(payload: impl Into<String>, created_at: i64, tags: Vec<String>) -> Self {
    Self {
      payload: payload.into(),
      created_at,
      tags,
    }
  }

  /// Age in milliseconds relative to `now`
  pub fn age_millis(&self, now: i64) -> i64 {
    now - self.created_at
  }

  pub fn has_any_tag(&self, tags: &[String]) -> bool {
    self.tags.iter().any(|t| tags.contains(t))
  }
}

#[derive(Debug, Error)]
#[error("malformed cache entry: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

pub fn encode(entry: &CacheEntry) -> String {
  // A struct of strings and integers always serializes
  serde_json::to_string(entry).unwrap_or_default()
}

pub fn decode(raw: &str) -> Result<CacheEntry, DecodeError> {
  Ok(serde_json::from_str(raw)?)
}

/// Decode, logging and discarding malformed input
pub(crate) fn decode_or_warn(key: &str, raw: &str) -> Option<CacheEntry> {
  match decode(raw) {
    Ok(entry) => Some(entry),
    Err(e) => {
      tracing::warn!(key = %key, "Ignoring cache entry: {}", e);
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_wire_format() {
    let entry = CacheEntry::new("<p>x</p>", 1_700_000_000_000, vec!["nav".into()]);
    let json: serde_json::Value = serde_json::from_str(&encode(&entry)).unwrap();
    assert_eq!(json["data"], "<p>x</p>");
    assert_eq!(json["timestamp"], 1_700_000_000_000i64);
    assert_eq!(json["tags"], serde_json::json!(["nav"]));
  }

  #[test]
  fn test_round_trip_edge_payloads() {
    let cases = [
      CacheEntry::new("", 0, vec![]),
      CacheEntry::new("héllo wörld ✓ 日本語", 42, vec!["ü".into()]),
      CacheEntry::new(
        "x",
        1,
        (0..50).map(|i| format!("tag-{}", i)).collect(),
      ),
      CacheEntry::new("\"quoted\"\n{json}", 7, vec![]),
    ];
    for entry in cases {
      assert_eq!(decode(&encode(&entry)).unwrap(), entry);
    }
  }

  #[test]
  fn test_missing_tags_defaults_empty() {
    let entry = decode(r#"{"data":"x","timestamp":5}"#).unwrap();
    assert!(entry.tags.is_empty());
  }

  #[test]
  fn test_decode_rejects_malformed() {
    assert!(decode("not json").is_err());
    assert!(decode(r#"{"data":"x"}"#).is_err());
    assert!(decode(r#"{"data":1,"timestamp":5}"#).is_err());
    assert!(decode_or_warn("k", "{").is_none());
  }

  #[test]
  fn test_has_any_tag() {
    let entry = CacheEntry::new("x", 0, vec!["a".into(), "b".into()]);
    assert!(entry.has_any_tag(&["b".into(), "z".into()]));
    assert!(!entry.has_any_tag(&["z".into()]));
    assert!(!entry.has_any_tag(&[]));
  }
}
