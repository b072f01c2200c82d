#![no_main]
use alpenhorn::pkg::ExtractArgs;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<ExtractArgs>(data);
});
