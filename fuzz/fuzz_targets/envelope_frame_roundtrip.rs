#![no_main]

use kiln_job::envelope::{read_json_frame, write_json_frame, ErrorEnvelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (String, String, String)| {
    let (domain, reason, message) = data;
    let envelope = ErrorEnvelope { domain, reason, message };

    let mut buf = Vec::new();
    write_json_frame(&mut buf, &envelope).expect("write always succeeds on a Vec");

    let decoded: Option<ErrorEnvelope> = read_json_frame(buf.as_slice()).expect("well-formed frame decodes");
    let decoded = decoded.expect("non-empty buffer yields a frame");

    assert_eq!(envelope.domain, decoded.domain);
    assert_eq!(envelope.reason, decoded.reason);
    assert_eq!(envelope.message, decoded.message);
});
