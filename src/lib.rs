//! Parallel bzip2 decompression.
//!
//! The input is read into fixed 1 MiB chunks, scanned for bzip2 block
//! boundaries (which can sit at any bit offset), and the blocks are decoded
//! concurrently by a pool of workers. A muxer reassembles the decoded
//! pieces in their original order, validating each stream's CRC on the way
//! out. Three monitor-protected queues connect the actors:
//!
//! ```text
//! bytes -> s-chunks -> decode jobs -> decoded sub-blocks -> ordered output
//!        splitter    scanning worker   decoding worker        muxer
//!          ^                                                    |
//!          +----------------- free slot credits ----------------+
//! ```
//!
//! Backpressure is a fixed budget of chunk slots: the splitter blocks until
//! the muxer has returned a credit, which bounds resident input memory.
//! Output order is restored with a lexicographic (chunk, block, sub-block)
//! key, so the result is byte-identical for any worker or slot count.

pub mod bits;
pub mod decoder;
pub mod error;
mod mux;
pub mod queue;
pub mod scanner;
mod split;
mod retrieve;
mod worker;

pub use error::{PipelineError, Result};

use queue::Shared;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::thread;

/// Words per input chunk (1 MiB). An upper bound on the size of any
/// compressed bzip2 block, which is what lets a scan touch at most two
/// chunks.
pub const CHUNK_WORDS: usize = 262_144;
/// Bytes per input chunk.
pub const CHUNK_BYTES: usize = CHUNK_WORDS * 4;

/// Tuning knobs for [`decompress`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Worker thread count, at least 1.
    pub workers: usize,
    /// Input chunk slots in flight. At least `workers + 1` are used
    /// whatever is asked for: every scan may hold a chunk while waiting for
    /// its successor, and the splitter needs one slot to produce it.
    pub slots: usize,
}

impl Options {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Options { workers, slots: workers * 4 }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new(thread::available_parallelism().map_or(1, NonZeroUsize::get))
    }
}

/// Decompresses a bzip2 byte stream (possibly several concatenated streams)
/// from `input` to `output`.
///
/// Runs one splitter thread, `opts.workers` worker threads and the muxer on
/// the calling thread. Any data error, framing error or CRC mismatch stops
/// the whole pipeline and is returned; the output may then hold a correct
/// prefix of the decompressed data, but the call never reports success for
/// truncated output.
pub fn decompress<R, W>(input: R, output: W, opts: &Options) -> Result<()>
where
    R: Read + Send,
    W: Write,
{
    let workers = opts.workers.max(1);
    let slots = opts.slots.max(workers + 1);
    log::debug!("pipeline: {workers} workers, {slots} slots");

    let shared = Shared::new(workers as u32, slots);
    let mut input = input;
    let mut output = output;

    thread::scope(|scope| {
        let shared = &shared;
        scope.spawn(move || {
            if let Err(err) = split::split(shared, &mut input) {
                shared.abort(err);
            }
        });
        for _ in 0..workers {
            scope.spawn(move || {
                if let Err(err) = worker::work(shared) {
                    shared.abort(err);
                }
                shared.w2m.worker_exit();
            });
        }
        // A muxer error must wake the other actors before the scope joins
        // them.
        if let Err(err) = mux::mux(shared, &mut output) {
            shared.abort(err);
        }
    });

    // The first error recorded anywhere in the pipeline is the one that
    // counts; later ones are teardown noise.
    if let Some(err) = shared.fail.take() {
        return Err(err);
    }
    output.flush()?;
    Ok(())
}
