#![no_main]

use kiln_cachekey::{weak_key, CanonicalValue};
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

fuzz_target!(|data: (String, Vec<String>)| {
    let (kind, dep_names) = data;

    let mut config = BTreeMap::new();
    config.insert("kind".to_string(), CanonicalValue::Str(kind));
    let config = CanonicalValue::Map(config);

    let deps: Vec<Option<String>> = dep_names.into_iter().map(Some).collect();

    // Computing the same key twice from the same inputs must always yield
    // the identical digest.
    let a = weak_key(&config, &deps);
    let b = weak_key(&config, &deps);
    assert_eq!(a, b);

    if let Some(key) = a {
        assert_eq!(key.len(), 64);
        assert!(kiln_types::is_key(&key));
    }
});
