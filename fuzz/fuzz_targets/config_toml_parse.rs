#![no_main]

use kiln_config::SessionConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Arbitrary TOML must never panic the parser, only fail cleanly.
    let _: Result<SessionConfig, _> = toml::from_str(data);
});
