#![no_main]

use libfuzzer_sys::fuzz_target;
use pbzcat::scanner::{find_block_magic, BLOCK_MAGIC};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 || data.len() > 1_000_000 {
        return;
    }

    let words: Vec<u32> = data
        .chunks(4)
        .map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            u32::from_be_bytes(w)
        })
        .collect();

    if let Some(hit) = find_block_magic(&words) {
        // The reported position must be sane and actually hold the magic.
        assert!(hit.pos <= words.len());
        assert!(hit.bits_left < 32);
        let end_bit = hit.pos * 32 - hit.bits_left as usize;
        assert!(end_bit >= 48);

        let mut value = 0u64;
        for bit in (end_bit - 48)..end_bit {
            let w = words[bit / 32];
            value = (value << 1) | u64::from(w >> (31 - (bit % 32)) & 1);
        }
        assert_eq!(value, BLOCK_MAGIC);
    }
});
