#![no_main]

use kiln_types::Element;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else { return };
    if let Ok(element) = serde_json::from_str::<Element>(text) {
        // Whatever parsed must round-trip without losing fields.
        let encoded = serde_json::to_string(&element).expect("Element always serializes");
        let reparsed: Element = serde_json::from_str(&encoded).expect("re-parse of our own output");
        assert_eq!(element.name, reparsed.name);
        assert_eq!(element.build_dependencies, reparsed.build_dependencies);
    }
});
