#![no_main]
use alpenhorn::bloom::Filter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(filter) = Filter::unmarshal_binary(data) {
        let _ = filter.test(b"probe");
    }
});
