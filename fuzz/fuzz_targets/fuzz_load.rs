#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Model deserialization should never panic, only reject bad input.
    let _ = serde_json::from_slice::<leveler_ir::ComputeGraph>(data);
});
