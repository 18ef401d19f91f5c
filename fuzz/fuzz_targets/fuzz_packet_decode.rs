#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use relay_link::core::codec::PacketCodec;
use tokio_util::codec::Decoder;

// Arbitrary bytes must never panic the decoder: they either yield packets,
// request more input, or fail with a protocol error.
fuzz_target!(|data: &[u8]| {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(data);
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
});
