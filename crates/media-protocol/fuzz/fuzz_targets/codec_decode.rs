#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use media_protocol::codec::decode_frame;

fuzz_target!(|data: &[u8]| {
    // Clients control every byte of an inbound media frame; decoding must
    // reject garbage with an error and never panic.
    let mut buf = Bytes::copy_from_slice(data);
    let _ = decode_frame(&mut buf);
});
