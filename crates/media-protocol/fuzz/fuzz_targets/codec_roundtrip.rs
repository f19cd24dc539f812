#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use media_protocol::codec::{decode_frame, encode_frame};

fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);

    if let Ok(frame) = decode_frame(&mut buf) {
        if let Ok(mut encoded) = encode_frame(&frame) {
            let again = decode_frame(&mut encoded).expect("re-encoded frame must decode");
            assert_eq!(frame.kind, again.kind);
            assert_eq!(frame.publisher, again.publisher);
            assert_eq!(frame.sequence, again.sequence);
            assert_eq!(frame.timestamp, again.timestamp);
            assert_eq!(frame.payload, again.payload);
        }
    }
});
