#![no_main]

use libfuzzer_sys::fuzz_target;
use nfs4slow::event_record;
use nfs4slow::render::render;

fuzz_target!(|data: &[u8]| {
    // Any byte string must either be rejected or decode and render cleanly
    if let Ok(record) = event_record::decode(data) {
        let _ = render(&record);
    }
});
