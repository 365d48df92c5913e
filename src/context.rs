//! Selection context and its stable hash: canonical JSON over sorted fields, SHA-256,
//! truncated to 16 hex chars (64 bits).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    ColdStart,
    Regular,
    PowerUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePeriod {
    Morning,
    Afternoon,
    Evening,
    Night,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Weekday,
    Weekend,
}

/// Selection context: a fixed set of recognized fields plus an overflow map for
/// experiment-specific extensions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    pub user_type: Option<UserType>,
    pub time_period: Option<TimePeriod>,
    pub day_of_week: Option<DayOfWeek>,
    pub genre_saturation: Option<f64>,
    pub session_position: Option<u32>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Stable hash of a `Context`, truncated to 64 bits (16 hex chars). Identical context maps
/// hash to identical keys regardless of insertion order, and the hash is stable across
/// processes and restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextKey(pub String);

impl ContextKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Context {
    /// Builds a sorted, flattened key-value map so serialization is order-independent,
    /// then hashes the canonical JSON encoding of that map.
    pub fn hash_key(&self) -> ContextKey {
        let mut flat: BTreeMap<String, serde_json::Value> = BTreeMap::new();

        if let Some(ut) = self.user_type {
            flat.insert(
                "user_type".to_string(),
                serde_json::to_value(ut).expect("UserType always serializes"),
            );
        }
        if let Some(tp) = self.time_period {
            flat.insert(
                "time_period".to_string(),
                serde_json::to_value(tp).expect("TimePeriod always serializes"),
            );
        }
        if let Some(dow) = self.day_of_week {
            flat.insert(
                "day_of_week".to_string(),
                serde_json::to_value(dow).expect("DayOfWeek always serializes"),
            );
        }
        if let Some(g) = self.genre_saturation {
            flat.insert(
                "genre_saturation".to_string(),
                serde_json::json!(canonical_float(g)),
            );
        }
        if let Some(p) = self.session_position {
            flat.insert("session_position".to_string(), serde_json::json!(p));
        }
        for (k, v) in &self.extra {
            flat.insert(k.clone(), v.clone());
        }

        // BTreeMap already yields keys in sorted order; serde_json preserves that order
        // when serializing a BTreeMap, giving a canonical encoding.
        let canonical =
            serde_json::to_string(&flat).expect("flattened context always serializes");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        ContextKey(hex::encode(digest)[..16].to_string())
    }
}

/// Collapses floating point to a fixed string representation so two semantically equal
/// floats never hash to different keys due to formatting differences.
fn canonical_float(f: f64) -> String {
    format!("{:.6}", f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_contexts_hash_identically() {
        let mut a = Context::default();
        a.user_type = Some(UserType::PowerUser);
        a.time_period = Some(TimePeriod::Evening);
        a.extra.insert("foo".to_string(), serde_json::json!(1));
        a.extra.insert("bar".to_string(), serde_json::json!(2));

        let mut b = Context::default();
        b.time_period = Some(TimePeriod::Evening);
        b.extra.insert("bar".to_string(), serde_json::json!(2));
        b.extra.insert("foo".to_string(), serde_json::json!(1));
        b.user_type = Some(UserType::PowerUser);

        assert_eq!(a.hash_key(), b.hash_key());
    }

    #[test]
    fn different_contexts_hash_differently() {
        let mut a = Context::default();
        a.user_type = Some(UserType::ColdStart);
        let mut b = Context::default();
        b.user_type = Some(UserType::Regular);
        assert_ne!(a.hash_key(), b.hash_key());
    }

    #[test]
    fn key_length_is_at_least_64_bits() {
        let ctx = Context::default();
        assert!(ctx.hash_key().as_str().len() * 4 >= 64);
    }
}
