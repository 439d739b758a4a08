//! The muxer: restores output order, validates stream CRCs and writes the
//! decompressed bytes.
//!
//! Sub-blocks arrive in arbitrary order on the delivery list and are merged
//! into a reorder queue keyed by (s_id, bz_id, sub_id). A cursor walks that
//! key space; everything the cursor reaches is written immediately, so no
//! reordering is ever observable downstream. The muxer is also the return
//! path for freed input slots, forwarding them to the splitter in batches.

use crate::error::{PipelineError, Result};
use crate::queue::{Shared, StreamMark, SubKey};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;

pub fn mux<W: Write>(shared: &Shared, out: &mut W) -> Result<()> {
    let mut reorder = BinaryHeap::new();
    let mut needed = SubKey::default();
    // Per-stream CRC accumulator: left-rotate then XOR each block CRC.
    let mut acc = 0u32;
    // The current stream's declared bs100k.
    let mut declared = 0u32;
    // At least one real stream seen.
    let mut any = false;
    // The final end-of-stream marker has been written; whatever still
    // arrives after it is decoded garbage and must not reach the output.
    let mut finished = false;
    let mut last_offs = 0u64;

    loop {
        let (subs, released, working) = shared.w2m.drain(needed, &shared.fail)?;
        if released > 0 {
            shared.m2s.put_slots(released);
        }
        for sub in subs {
            reorder.push(Reverse(sub));
        }

        // Emit the contiguous run the cursor has caught up with.
        while reorder.peek().is_some_and(|Reverse(s)| s.id.key() == needed) {
            let Reverse(sub) = reorder.pop().unwrap();
            if !finished {
                if sub.id.last_sub {
                    acc = acc.rotate_left(1) ^ sub.block_crc;
                    if declared < sub.bs100k1 {
                        return Err(PipelineError::BlockOverrun);
                    }
                    match sub.mark {
                        StreamMark::Unchanged => {}
                        StreamMark::NewStream(bs100k) => {
                            if acc != sub.stream_crc {
                                return Err(PipelineError::StreamCrcMismatch);
                            }
                            acc = 0;
                            declared = bs100k;
                            any = true;
                        }
                        StreamMark::Eos => {
                            if acc != sub.stream_crc {
                                return Err(PipelineError::StreamCrcMismatch);
                            }
                            acc = 0;
                            finished = true;
                        }
                    }
                }
                if !sub.data.is_empty() {
                    out.write_all(&sub.data)?;
                }
                if sub.id.last_sub && sub.end_offs > last_offs {
                    last_offs = sub.end_offs;
                    log::trace!("muxer: input consumed through byte {last_offs}");
                }
            }
            needed = needed.advance(&sub.id);
        }

        if working == 0 {
            break;
        }
    }

    if !any {
        return Err(PipelineError::NotBzip2);
    }
    debug_assert!(reorder.is_empty());
    debug_assert_eq!((needed.bz_id, needed.sub_id), (0, 0));
    Ok(())
}
