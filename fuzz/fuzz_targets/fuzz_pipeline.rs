#![no_main]

use libfuzzer_sys::fuzz_target;
use pbzcat::{decompress, Options};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 1_000_000 {
        return;
    }

    // Arbitrary input must decode or fail cleanly: no panic, no hang, no
    // partial success.
    let mut out = Vec::new();
    let _ = decompress(data, &mut out, &Options { workers: 2, slots: 2 });
});
