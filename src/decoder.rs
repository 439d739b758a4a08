//! The block codec seen by the pipeline: a decoder object with a fixed
//! retrieve / work / emit operation set.
//!
//! `retrieve` pulls a block's Huffman-coded payload out of the input chunks
//! by running the block-header and end-of-stream automata side by side until
//! one of them accepts, capturing every bit on the way (the trailing magic
//! is trimmed off again). `work` then rebuilds a minimal single-block bzip2
//! stream around the captured bits and hands it to libbz2:
//!
//! ```text
//! "BZh9" | block magic | captured bits | EOS magic | stream CRC | pad
//! ```
//!
//! A single-block stream's CRC equals the block's own stored CRC (the fold
//! is a rotate-XOR starting from zero), so the synthetic stream is fully
//! valid and libbz2 verifies both the block CRC and the framing for us.
//! `emit` slices the expanded bytes into bounded sub-blocks; run-length
//! expansion means one block can produce far more than its nominal 900 kB.

use crate::bits::{BitCursor, BitWriter};
use crate::error::{PipelineError, Result};
use crate::scanner::{
    ACCEPT, BLOCK_BIG, BLOCK_MAGIC, BLOCK_MINI, EOS_BIG, EOS_MAGIC, EOS_MINI, MAGIC_BITS,
};
use std::io::Read;

/// Output granularity of `emit`.
pub const EMIT_BYTES: usize = 1024 * 1024;

/// Outcome of [`BlockDecoder::retrieve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieve {
    /// Block captured; another block header follows at the cursor.
    Block,
    /// Block captured; the end-of-stream marker follows at the cursor.
    StreamEnd,
    /// The chunk ran out mid-block; call again with the successor chunk.
    Underflow,
}

/// Outcome of [`BlockDecoder::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    /// More output follows; call again.
    More,
    /// Final slice delivered; `crc` is the block's CRC.
    Done { crc: u32 },
}

/// Decoder for a single bzip2 block. One instance per block, owned by one
/// worker at a time.
#[derive(Debug, Default)]
pub struct BlockDecoder {
    block_state: u8,
    eos_state: u8,
    capture: BitWriter,
    out: Vec<u8>,
    emitted: usize,
    crc: u32,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies compressed bits from `words` (resuming at `cur`) into the
    /// internal capture until the next 48-bit magic classifies the block
    /// end, or the chunk runs out.
    pub fn retrieve(&mut self, words: &[u32], cur: &mut BitCursor) -> Retrieve {
        loop {
            if !cur.fill(8, words) {
                // Fewer than 8 bits remain in this chunk; the magic can
                // still end inside them.
                while cur.bits_left() > 0 {
                    let bit = cur.take(1);
                    self.capture.push_bits(u64::from(bit), 1);
                    self.block_state = BLOCK_MINI[self.block_state as usize][bit as usize];
                    self.eos_state = EOS_MINI[self.eos_state as usize][bit as usize];
                    if let Some(hit) = self.classify() {
                        return hit;
                    }
                }
                return Retrieve::Underflow;
            }
            let byte = cur.take(8);
            let (block_was, eos_was) = (self.block_state, self.eos_state);
            self.block_state = BLOCK_BIG[block_was as usize][byte as usize];
            self.eos_state = EOS_BIG[eos_was as usize][byte as usize];
            if self.block_state != ACCEPT && self.eos_state != ACCEPT {
                self.capture.push_byte(byte as u8);
                continue;
            }
            // A magic ended somewhere in this byte: replay it bitwise to
            // pin the exact bit, and push the unused tail back.
            self.block_state = block_was;
            self.eos_state = eos_was;
            for i in (0..8u32).rev() {
                let bit = byte >> i & 1;
                self.capture.push_bits(u64::from(bit), 1);
                self.block_state = BLOCK_MINI[self.block_state as usize][bit as usize];
                self.eos_state = EOS_MINI[self.eos_state as usize][bit as usize];
                if let Some(hit) = self.classify() {
                    cur.unread(i);
                    return hit;
                }
            }
            unreachable!("byte-rate and bit-rate automata disagree");
        }
    }

    fn classify(&mut self) -> Option<Retrieve> {
        let hit = if self.block_state == ACCEPT {
            Retrieve::Block
        } else if self.eos_state == ACCEPT {
            Retrieve::StreamEnd
        } else {
            return None;
        };
        // The trailing magic belongs to the next block, not to this one.
        self.capture.truncate_bits(self.capture.bit_len() - MAGIC_BITS as usize);
        Some(hit)
    }

    /// Decompresses the captured block. Returns the block's size class
    /// (`bs100k` units), to be checked against the stream's declared one.
    pub fn work(&mut self) -> Result<u32> {
        // The first 32 captured bits are the block's stored CRC.
        let Some(stored_crc) = self.capture.peek_u32(0) else {
            return Err(PipelineError::BlockData("truncated block header".into()));
        };
        let mut stream = BitWriter::with_capacity(self.capture.bit_len() / 8 + 24);
        stream.extend_bytes(b"BZh9");
        stream.push_bits(BLOCK_MAGIC, MAGIC_BITS);
        stream.append(&self.capture);
        stream.push_bits(EOS_MAGIC, MAGIC_BITS);
        stream.push_bits(u64::from(stored_crc), 32);

        self.out.clear();
        let mut dec = bzip2::read::BzDecoder::new(stream.as_bytes());
        dec.read_to_end(&mut self.out)
            .map_err(|e| PipelineError::BlockData(e.to_string()))?;
        self.crc = stored_crc;
        Ok(size_class(&self.out))
    }

    /// Fills `out` with the next slice of expanded bytes, at most
    /// [`EMIT_BYTES`] at a time.
    pub fn emit(&mut self, out: &mut Vec<u8>) -> Emit {
        let n = (self.out.len() - self.emitted).min(EMIT_BYTES);
        out.clear();
        out.extend_from_slice(&self.out[self.emitted..self.emitted + n]);
        self.emitted += n;
        if self.emitted == self.out.len() {
            Emit::Done { crc: self.crc }
        } else {
            Emit::More
        }
    }
}

/// The bs100k class a block of this expanded size must have been stored
/// with. bs100k bounds the run-length-encoded form of the data (runs of 4 to
/// 259 equal bytes collapse into five), not the expanded byte count.
fn size_class(data: &[u8]) -> u32 {
    let mut len = 0usize;
    let mut i = 0usize;
    while i < data.len() {
        let b = data[i];
        let mut run = 1usize;
        while run < 259 && i + run < data.len() && data[i + run] == b {
            run += 1;
        }
        len += if run >= 4 { 5 } else { run };
        i += run;
    }
    (len.max(1)).div_ceil(100_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::find_block_magic;
    use std::io::Write;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(9));
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn to_words(bytes: &[u8]) -> Vec<u32> {
        let mut words = Vec::with_capacity(bytes.len().div_ceil(4));
        for c in bytes.chunks(4) {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            words.push(u32::from_be_bytes(w));
        }
        words
    }

    #[test]
    fn retrieve_work_emit_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog\n".repeat(64);
        let words = to_words(&compress(&data));

        let hit = find_block_magic(&words).unwrap();
        let mut cur = BitCursor::at(hit.pos, hit.word, hit.bits_left);
        let mut dec = BlockDecoder::new();
        assert_eq!(dec.retrieve(&words, &mut cur), Retrieve::StreamEnd);
        let class = dec.work().unwrap();
        assert_eq!(class, 1);

        let mut out = Vec::new();
        let mut produced = Vec::new();
        loop {
            match dec.emit(&mut out) {
                Emit::More => produced.extend_from_slice(&out),
                Emit::Done { crc } => {
                    produced.extend_from_slice(&out);
                    assert_ne!(crc, 0);
                    break;
                }
            }
        }
        assert_eq!(produced, data);
    }

    #[test]
    fn retrieve_resumes_after_underflow() {
        let data = b"split me across two chunks ".repeat(2000);
        let words = to_words(&compress(&data));
        let (a, b) = words.split_at(words.len() / 2);

        let hit = find_block_magic(a).unwrap();
        let mut cur = BitCursor::at(hit.pos, hit.word, hit.bits_left);
        let mut dec = BlockDecoder::new();
        assert_eq!(dec.retrieve(a, &mut cur), Retrieve::Underflow);
        cur.rewind_words();
        assert_eq!(dec.retrieve(b, &mut cur), Retrieve::StreamEnd);
        dec.work().unwrap();
        let mut out = Vec::new();
        assert!(matches!(dec.emit(&mut out), Emit::Done { .. }));
        assert_eq!(out, data);
    }

    #[test]
    fn retrieve_stops_at_next_block_header() {
        // A capture followed directly by a second block header.
        let mut stream = BitWriter::new();
        stream.push_bits(0xDEAD_BEEF, 32); // stored CRC placeholder
        stream.push_bits(0x1234, 16);
        stream.push_bits(BLOCK_MAGIC, MAGIC_BITS);
        stream.push_bits(0xFFFF, 16);
        let words = to_words(stream.as_bytes());

        let mut cur = BitCursor::new();
        let mut dec = BlockDecoder::new();
        assert_eq!(dec.retrieve(&words, &mut cur), Retrieve::Block);
        assert_eq!(dec.capture.bit_len(), 48);
        assert_eq!(dec.capture.peek_u32(0), Some(0xDEAD_BEEF));
    }

    #[test]
    fn corrupt_block_is_a_data_error() {
        let data = b"some block payload to corrupt".repeat(50);
        let mut packed = compress(&data);
        // Flip a bit well inside the Huffman payload.
        let mid = packed.len() / 2;
        packed[mid] ^= 0x10;
        let words = to_words(&packed);

        let hit = find_block_magic(&words).unwrap();
        let mut cur = BitCursor::at(hit.pos, hit.word, hit.bits_left);
        let mut dec = BlockDecoder::new();
        // The trailing EOS magic is intact, so retrieval still terminates.
        assert_eq!(dec.retrieve(&words, &mut cur), Retrieve::StreamEnd);
        assert!(matches!(dec.work(), Err(PipelineError::BlockData(_))));
    }

    #[test]
    fn size_class_counts_rle_runs() {
        assert_eq!(size_class(b""), 1);
        assert_eq!(size_class(&[0u8; 1_000_000]), 1); // collapses to ~20 kB
        let spread: Vec<u8> = (0..250_000u32).map(|i| i as u8).flat_map(|b| [b, !b]).collect();
        assert!(size_class(&spread) > 4);
    }
}
