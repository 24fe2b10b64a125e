#![no_main]

use kiln_remote::ArtifactRef;
use libfuzzer_sys::fuzz_target;
use std::str::FromStr;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = ArtifactRef::from_str(data) {
        assert!(!parsed.project.is_empty());
        assert!(!parsed.element_path.is_empty());
        assert!(kiln_types::is_key(&parsed.key));

        // Re-parsing the rendered form must produce the same ref.
        let rendered = parsed.to_string();
        let reparsed = ArtifactRef::from_str(&rendered).expect("our own rendering always re-parses");
        assert_eq!(parsed.project, reparsed.project);
        assert_eq!(parsed.element_path, reparsed.element_path);
        assert_eq!(parsed.key, reparsed.key);
    }
});
