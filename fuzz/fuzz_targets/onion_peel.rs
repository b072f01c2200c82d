#![no_main]
use alpenhorn::onion;
use libfuzzer_sys::fuzz_target;
use x25519_dalek::StaticSecret;

fuzz_target!(|data: &[u8]| {
    let secret = StaticSecret::from([7u8; 32]);
    let _ = onion::peel(data, &onion::forward_nonce(1), &secret);
});
