#![no_main]

use libfuzzer_sys::fuzz_target;
use signaling_protocol::codec::{decode_envelope_bytes, encode_envelope};

fuzz_target!(|data: &[u8]| {
    // Decoding must never panic, only return Err for invalid input
    if let Ok(envelope) = decode_envelope_bytes(data) {
        // Anything that decodes passed validation, so it must encode again
        assert!(encode_envelope(&envelope).is_ok());
    }
});
