//! Worker threads: cooperative dispatch between scanning and decoding.
//!
//! Every worker loops on [`get_first`], which hands out either a ready
//! decode job or the next chunk to scan. Decoding takes strict priority over
//! scanning: finished output drains the pipeline and frees input slots,
//! while more scanning only adds to the backlog.

use crate::decoder::Emit;
use crate::error::{PipelineError, Result};
use crate::queue::{DecodeJob, SChunk, Shared, SubBlock, SubId};
use crate::retrieve;
use std::cmp::Reverse;
use std::sync::Arc;

/// Body of one worker thread. Returns when the splitter has hit EOF and all
/// scans and decode jobs are finished.
pub fn work(shared: &Shared) -> Result<()> {
    while let Some(chunk) = get_first(shared)? {
        retrieve::scan(shared, chunk)?;
    }
    Ok(())
}

/// Fetches this worker's next piece of work: runs any ready decode jobs
/// inline, then takes the head of the scan chain. Returns None when the
/// pipeline is drained and the worker should exit.
fn get_first(shared: &Shared) -> Result<Option<Arc<SChunk>>> {
    let q = &shared.sw2w;
    let mut st = q.state.lock().unwrap();
    debug_assert!(st.scanning > 0);
    st.scanning -= 1;
    let mut looped = false;
    loop {
        if shared.fail.is_set() {
            return Err(PipelineError::Aborted);
        }
        if let Some(Reverse(job)) = st.deco_q.pop() {
            drop(st);
            decode(shared, job)?;
            st = q.state.lock().unwrap();
        } else if st.next_scan.is_some() {
            st.scanning += 1;
            let chunk = st.next_scan.take().unwrap();
            st.next_scan = chunk.next.get().cloned();
            return Ok(Some(chunk));
        } else if st.eof && st.scanning == 0 {
            // This worker just took the last scan off the books; the others
            // may be blocked waiting for work that will never come.
            if !looped {
                q.proceed.notify_all();
            }
            return Ok(None);
        } else {
            st = q.proceed.wait(st).unwrap();
        }
        looped = true;
    }
}

/// Fetches the successor of `cur` for a retriever whose block continues past
/// the chunk boundary, servicing decode jobs while it waits. Releases `cur`.
/// Returns None at end of input.
pub(crate) fn get_second(shared: &Shared, cur: Arc<SChunk>) -> Result<Option<Arc<SChunk>>> {
    let q = &shared.sw2w;
    let mut st = q.state.lock().unwrap();
    loop {
        if shared.fail.is_set() {
            return Err(PipelineError::Aborted);
        }
        if let Some(Reverse(job)) = st.deco_q.pop() {
            drop(st);
            decode(shared, job)?;
            st = q.state.lock().unwrap();
        } else if st.next_scan.is_some() || st.eof {
            // Once the chain has advanced past `cur` (or EOF arrived), the
            // successor link is final.
            debug_assert!(st.next_scan.is_none() || cur.next.get().is_some());
            let next = cur.next.get().cloned();
            drop(st);
            shared.release_chunk(&cur);
            return Ok(next);
        } else {
            st = q.proceed.wait(st).unwrap();
        }
    }
}

/// Runs one decode job to completion, pushing sub-blocks to the muxer.
fn decode(shared: &Shared, job: DecodeJob) -> Result<()> {
    let DecodeJob { id, decoder, mark, stream_crc, end_offs } = job;

    let Some(mut decoder) = decoder else {
        // Stream-header marker: no payload, only the metadata transition.
        shared.w2m.push_sub(SubBlock {
            id: SubId { s_id: id.s_id, bz_id: id.bz_id, sub_id: 0, last_bz: id.last_bz, last_sub: true },
            data: Vec::new(),
            mark,
            bs100k1: 0,
            stream_crc,
            block_crc: 0,
            end_offs: 0,
        });
        return Ok(());
    };

    let bs100k1 = decoder.work()?;
    log::trace!("decoded block ({}, {}), class {bs100k1}", id.s_id, id.bz_id);
    let mut sub_id = 0u64;
    loop {
        let mut data = Vec::new();
        let status = decoder.emit(&mut data);
        let (last_sub, block_crc) = match status {
            Emit::Done { crc } => (true, crc),
            Emit::More => (false, 0),
        };
        shared.w2m.push_sub(SubBlock {
            id: SubId { s_id: id.s_id, bz_id: id.bz_id, sub_id, last_bz: id.last_bz, last_sub },
            data,
            mark,
            bs100k1,
            stream_crc,
            block_crc,
            end_offs,
        });
        if last_sub {
            return Ok(());
        }
        sub_id += 1;
    }
}
