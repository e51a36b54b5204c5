#![no_main]

use libfuzzer_sys::fuzz_target;
use nfs4slow::config::EngineConfig;
use nfs4slow::layout::LayoutSet;
use nfs4slow::replay::Replayer;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Malformed lines must come back as errors, never panics
        if let Ok(replayer) = Replayer::new(EngineConfig::default(), LayoutSet::reference()) {
            let _ = replayer.feed(1, line);
        }
    }
});
