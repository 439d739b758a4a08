//! The splitter: reads the raw input into fixed-size chunks and feeds the
//! scan chain, throttled by the free-slot count.

use crate::error::Result;
use crate::queue::{SChunk, Shared};
use crate::{CHUNK_BYTES, CHUNK_WORDS};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

/// Reads chunks until end of input. Each chunk costs one slot credit, which
/// comes back (via the muxer) when the last scan holding the chunk lets go.
pub fn split<R: Read>(shared: &Shared, input: &mut R) -> Result<()> {
    let mut prev: Option<Arc<SChunk>> = None;
    let mut id = 0u64;
    let mut buf = vec![0u8; CHUNK_BYTES];

    loop {
        shared.m2s.take_slot(&shared.fail)?;
        let filled = read_full(input, &mut buf)?;
        if filled == 0 {
            // End of input on a chunk boundary: give the unused slot back
            // and publish EOF.
            shared.m2s.put_slots(1);
            let mut st = shared.sw2w.state.lock().unwrap();
            if st.next_scan.is_none() && st.deco_q.is_empty() {
                shared.sw2w.proceed.notify_all();
            }
            st.eof = true;
            log::debug!("splitter: end of input after {id} chunks");
            return Ok(());
        }

        id += 1;
        let chunk = Arc::new(SChunk::new(id, words_from_bytes(&buf[..filled]), prev.is_some()));
        let short = filled < CHUNK_BYTES;
        log::trace!("splitter: chunk {id}, {filled} bytes{}", if short { " (last)" } else { "" });
        {
            let mut st = shared.sw2w.state.lock().unwrap();
            debug_assert!(!st.eof);
            if st.next_scan.is_none() {
                if st.deco_q.is_empty() {
                    shared.sw2w.proceed.notify_all();
                }
                st.next_scan = Some(chunk.clone());
            }
            if let Some(prev) = &prev {
                let set = prev.next.set(chunk.clone());
                debug_assert!(set.is_ok());
            }
            if short {
                st.eof = true;
            }
        }
        if short {
            log::debug!("splitter: end of input after {id} chunks");
            return Ok(());
        }
        prev = Some(chunk);
    }
}

/// Reads until `buf` is full or the input ends.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Packs bytes into big-endian 32-bit words, zero-padding the last word.
/// The padding is safe: trailing garbage after a bzip2 stream is ignored.
fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    let mut words = Vec::with_capacity(CHUNK_WORDS);
    let mut chunks = bytes.chunks_exact(4);
    for c in chunks.by_ref() {
        words.push(u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        words.push(u32::from_be_bytes(last));
    }
    words
}
