//! Weak/strict/strong cache-key computation.
//!
//! Every key is a lowercase hex SHA-256 digest of a canonical serialization
//! of an element's configuration plus its dependency keys. `None` always
//! means "unresolved" (an input is still missing) — key computation itself
//! never fails.
//!
//! # Example
//! ```
//! use kiln_cachekey::{CanonicalValue, weak_key};
//! use std::collections::BTreeMap;
//!
//! let mut config = BTreeMap::new();
//! config.insert("kind".to_string(), CanonicalValue::Str("manual".into()));
//! let config = CanonicalValue::Map(config);
//!
//! let key = weak_key(&config, &[Some("base.bst".to_string())]).unwrap();
//! assert_eq!(key.len(), 64);
//! assert!(key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
//! ```

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

pub use kiln_types::is_key;

/// A value that can appear in an element's `config_dict`. Deliberately a
/// small closed set rather than `serde_json::Value`, so that `Map`'s
/// `BTreeMap` ordering — and therefore the canonical serialization's
/// sorted-keys property — is a type guarantee rather than a convention
/// callers must remember to uphold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<CanonicalValue>),
    Map(BTreeMap<String, CanonicalValue>),
}

/// Generates a SHA-256 hex digest from a canonical value: `serde_json`
/// already emits object keys in the order a `BTreeMap` iterates them
/// (sorted) and never escapes `/`, so no extra normalization step is
/// needed beyond using `CanonicalValue::Map`.
pub fn generate_key(value: &CanonicalValue) -> String {
    let bytes = serde_json::to_vec(value).expect("CanonicalValue always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn combine(config_dict: &CanonicalValue, dep_values: Vec<String>) -> CanonicalValue {
    let mut map = BTreeMap::new();
    map.insert("config".to_string(), config_dict.clone());
    map.insert(
        "dependencies".to_string(),
        CanonicalValue::List(dep_values.into_iter().map(CanonicalValue::Str).collect()),
    );
    CanonicalValue::Map(map)
}

/// The weak key: `config_dict` plus either build-dep names (default) or
/// build-dep weak keys (under `strict_rebuild`). The caller decides which of
/// those two to pass as `deps` — this function only folds them in and
/// refuses to produce a key if any entry is `None` (unresolved).
pub fn weak_key(config_dict: &CanonicalValue, deps: &[Option<String>]) -> Option<String> {
    let resolved: Option<Vec<String>> = deps.iter().cloned().collect();
    Some(generate_key(&combine(config_dict, resolved?)))
}

/// The strict key: `config_dict` plus the transitive closure of build-deps'
/// strict keys. `None` if any dependency's strict key is itself unresolved.
pub fn strict_key(config_dict: &CanonicalValue, dep_strict_keys: &[Option<String>]) -> Option<String> {
    weak_key(config_dict, dep_strict_keys)
}
