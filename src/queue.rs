//! The three monitor-protected queues wiring splitter, workers and muxer
//! together, plus the blocks that travel through them.
//!
//! Ownership of input chunks crosses thread boundaries twice (a chunk is
//! scanned by one worker and may be the continuation chunk of its
//! predecessor's scan), so chunks carry an explicit reference count in
//! addition to the `Arc` that manages the memory: the count decides when the
//! chunk's slot credit goes back to the splitter.

use crate::decoder::BlockDecoder;
use crate::error::{PipelineError, Result};
use crate::CHUNK_WORDS;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as MemOrder};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// A fixed-size chunk of input, split off by the splitter and scanned by
/// exactly one worker. `words` holds big-endian 32-bit words; a short chunk
/// (fewer than [`CHUNK_WORDS`] words) is always the last one.
pub struct SChunk {
    /// Serial number, starting at 1.
    pub id: u64,
    pub words: Vec<u32>,
    /// Link to the successor chunk, written once by the splitter under the
    /// SW->W monitor.
    pub next: OnceLock<Arc<SChunk>>,
    /// Holders that still need this chunk: its own scanner, plus the
    /// predecessor's scanner while that scan may continue into us. Mutated
    /// only under the SW->W monitor; reaching zero returns a slot credit.
    refno: AtomicU32,
}

impl SChunk {
    pub fn new(id: u64, words: Vec<u32>, has_predecessor: bool) -> Self {
        SChunk {
            id,
            words,
            next: OnceLock::new(),
            refno: AtomicU32::new(1 + u32::from(has_predecessor)),
        }
    }

    pub fn is_full(&self) -> bool {
        self.words.len() == CHUNK_WORDS
    }
}

/// Stream-level event attached to a block when its trailing bytes were
/// parsed by the retriever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMark {
    /// Plain block in the middle of a stream.
    Unchanged,
    /// A new stream (with the given bs100k, 1..=9) starts right after this
    /// block.
    NewStream(u32),
    /// The input ends after this block's stream.
    Eos,
}

/// Identity of a decode job: which scan produced it and where in that scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobId {
    pub s_id: u64,
    pub bz_id: u64,
    pub last_bz: bool,
}

/// One bzip2 block captured and ready for decoding. `decoder` is None for
/// the stream-header marker the first scan emits before any real block.
pub struct DecodeJob {
    pub id: JobId,
    pub decoder: Option<BlockDecoder>,
    pub mark: StreamMark,
    /// Stored stream CRC, meaningful when `mark` is not `Unchanged`.
    pub stream_crc: u32,
    /// Input byte offset just past this block (word granularity).
    pub end_offs: u64,
}

impl PartialEq for DecodeJob {
    fn eq(&self, other: &Self) -> bool {
        (self.id.s_id, self.id.bz_id) == (other.id.s_id, other.id.bz_id)
    }
}
impl Eq for DecodeJob {}
impl PartialOrd for DecodeJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DecodeJob {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.id.s_id, self.id.bz_id).cmp(&(other.id.s_id, other.id.bz_id))
    }
}

/// Identity of a decoded sub-block within the whole output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubId {
    pub s_id: u64,
    pub bz_id: u64,
    pub sub_id: u64,
    pub last_bz: bool,
    pub last_sub: bool,
}

impl SubId {
    pub fn key(&self) -> SubKey {
        SubKey { s_id: self.s_id, bz_id: self.bz_id, sub_id: self.sub_id }
    }
}

/// Lexicographic ordering key for sub-blocks; also the muxer's cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubKey {
    pub s_id: u64,
    pub bz_id: u64,
    pub sub_id: u64,
}

impl SubKey {
    /// The key that must be written right after the sub-block `id`.
    pub fn advance(self, id: &SubId) -> SubKey {
        if !id.last_sub {
            SubKey { sub_id: self.sub_id + 1, ..self }
        } else if !id.last_bz {
            SubKey { s_id: self.s_id, bz_id: self.bz_id + 1, sub_id: 0 }
        } else {
            SubKey { s_id: self.s_id + 1, bz_id: 0, sub_id: 0 }
        }
    }
}

/// Up to 1 MiB of one block's decompressed output, on its way to the muxer.
pub struct SubBlock {
    pub id: SubId,
    pub data: Vec<u8>,
    pub mark: StreamMark,
    /// This block's size class, checked against the stream's declared one.
    pub bs100k1: u32,
    /// Stored stream CRC, meaningful when `mark` is not `Unchanged`.
    pub stream_crc: u32,
    /// Computed block CRC, meaningful on the last sub-block.
    pub block_crc: u32,
    pub end_offs: u64,
}

impl PartialEq for SubBlock {
    fn eq(&self, other: &Self) -> bool {
        self.id.key() == other.id.key()
    }
}
impl Eq for SubBlock {}
impl PartialOrd for SubBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SubBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.key().cmp(&other.id.key())
    }
}

/// Muxer-to-splitter queue: a count of free input slots. Bounds resident
/// memory to roughly `num_slot` chunks.
pub struct M2sQueue {
    free: Mutex<usize>,
    avail: Condvar,
}

impl M2sQueue {
    fn new(slots: usize) -> Self {
        M2sQueue { free: Mutex::new(slots), avail: Condvar::new() }
    }

    /// Blocks until a slot is free and takes it.
    pub fn take_slot(&self, fail: &Failure) -> Result<()> {
        let mut free = self.free.lock().unwrap();
        loop {
            if fail.is_set() {
                return Err(PipelineError::Aborted);
            }
            if *free > 0 {
                *free -= 1;
                return Ok(());
            }
            free = self.avail.wait(free).unwrap();
        }
    }

    /// Returns a batch of slots; wakes the splitter only on the empty to
    /// non-empty transition.
    pub fn put_slots(&self, n: usize) {
        let mut free = self.free.lock().unwrap();
        if *free == 0 {
            self.avail.notify_one();
        }
        *free += n;
    }
}

/// State behind the SW->W monitor: the scan chain and the decode queue.
pub struct Sw2wState {
    /// Head of the chain of chunks awaiting a scan.
    pub next_scan: Option<Arc<SChunk>>,
    /// Set once the splitter has produced its last chunk.
    pub eof: bool,
    /// Ready decode jobs, lowest (s_id, bz_id) first.
    pub deco_q: BinaryHeap<Reverse<DecodeJob>>,
    /// Workers currently scanning (producing decode jobs).
    pub scanning: u32,
}

/// Splitter-and-workers-to-workers queue.
///
/// A single condition variable serves two different consumer predicates:
///
/// ```text
/// get_first  proceeds iff  !deco_q.empty || next_scan.some || (eof && scanning == 0)
/// get_second proceeds iff  !deco_q.empty || next_scan.some || eof
/// ```
///
/// The second predicate is implied by the first, so one broadcast site
/// serves both; with two condvars every producer would have to consider
/// both anyway. Producers broadcast only when a predicate can flip from
/// false to true, which is exactly when both the decode queue and the scan
/// chain were empty: publishing a chunk, queueing a decode job into the
/// void, or the (once-per-run) EOF transition. The only spurious wakeup is
/// that EOF transition while some workers are still scanning.
pub struct Sw2wQueue {
    pub state: Mutex<Sw2wState>,
    pub proceed: Condvar,
}

impl Sw2wQueue {
    fn new(workers: u32) -> Self {
        Sw2wQueue {
            state: Mutex::new(Sw2wState {
                next_scan: None,
                eof: false,
                deco_q: BinaryHeap::new(),
                scanning: workers,
            }),
            proceed: Condvar::new(),
        }
    }

    /// Publishes a completed decode job to the worker pool.
    pub fn push_job(&self, job: DecodeJob) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.scanning > 0);
        if st.deco_q.is_empty() && st.next_scan.is_none() {
            self.proceed.notify_all();
        }
        st.deco_q.push(Reverse(job));
    }
}

/// State behind the W->M monitor.
pub struct W2mState {
    /// Unordered delivery list of finished sub-blocks.
    pub head: Vec<SubBlock>,
    /// The muxer's next-expected key, published so workers can signal
    /// exactly when the blocking sub-block arrives.
    pub needed: SubKey,
    /// Workers that have not exited yet.
    pub working: u32,
    /// Slot credits released by workers, not yet forwarded to the splitter.
    pub num_rel: u32,
}

/// Workers-to-muxer queue. The muxer sleeps unless there is a delivery, a
/// released slot to forward, or every worker has exited.
pub struct W2mQueue {
    state: Mutex<W2mState>,
    wake: Condvar,
}

impl W2mQueue {
    fn new(workers: u32) -> Self {
        W2mQueue {
            state: Mutex::new(W2mState {
                head: Vec::new(),
                needed: SubKey::default(),
                working: workers,
                num_rel: 0,
            }),
            wake: Condvar::new(),
        }
    }

    pub fn push_sub(&self, sub: SubBlock) {
        let mut st = self.state.lock().unwrap();
        debug_assert!(st.working > 0);
        let signal = st.num_rel == 0 && sub.id.key() == st.needed;
        st.head.push(sub);
        if signal {
            self.wake.notify_one();
        }
    }

    /// Records one released slot credit for the muxer to forward.
    pub fn add_release(&self) {
        let mut st = self.state.lock().unwrap();
        st.num_rel += 1;
        if st.num_rel == 1 {
            self.wake.notify_one();
        }
    }

    pub fn worker_exit(&self) {
        let mut st = self.state.lock().unwrap();
        st.working -= 1;
        if st.working == 0 && st.num_rel == 0 && st.head.is_empty() {
            self.wake.notify_one();
        }
    }

    /// Publishes the muxer's cursor, then blocks until there is something to
    /// do. Returns the whole delivery list, the released-slot count and the
    /// number of workers still running.
    pub fn drain(&self, needed: SubKey, fail: &Failure) -> Result<(Vec<SubBlock>, usize, u32)> {
        let mut st = self.state.lock().unwrap();
        st.needed = needed;
        loop {
            if fail.is_set() {
                return Err(PipelineError::Aborted);
            }
            if !st.head.is_empty() || st.working == 0 || st.num_rel > 0 {
                let subs = mem::take(&mut st.head);
                let released = mem::replace(&mut st.num_rel, 0) as usize;
                return Ok((subs, released, st.working));
            }
            st = self.wake.wait(st).unwrap();
        }
    }
}

/// First-error latch. Every suspension point in the pipeline re-checks it,
/// so a fatal error in any thread unwinds the whole pipeline.
#[derive(Default)]
pub struct Failure {
    tripped: AtomicBool,
    first: Mutex<Option<PipelineError>>,
}

impl Failure {
    pub fn is_set(&self) -> bool {
        self.tripped.load(MemOrder::Acquire)
    }

    fn set(&self, err: PipelineError) {
        let mut first = self.first.lock().unwrap();
        if first.is_none() && !matches!(err, PipelineError::Aborted) {
            *first = Some(err);
        }
        self.tripped.store(true, MemOrder::Release);
    }

    pub fn take(&self) -> Option<PipelineError> {
        self.first.lock().unwrap().take()
    }
}

/// Everything the pipeline actors share.
pub struct Shared {
    pub m2s: M2sQueue,
    pub sw2w: Sw2wQueue,
    pub w2m: W2mQueue,
    pub fail: Failure,
}

impl Shared {
    pub fn new(workers: u32, slots: usize) -> Self {
        Shared {
            m2s: M2sQueue::new(slots),
            sw2w: Sw2wQueue::new(workers),
            w2m: W2mQueue::new(workers),
            fail: Failure::default(),
        }
    }

    /// Records a fatal error and wakes every blocked actor. Each notify is
    /// sent under its monitor's lock so it cannot slip between an actor's
    /// failure check and its wait.
    pub fn abort(&self, err: PipelineError) {
        if !matches!(err, PipelineError::Aborted) {
            log::debug!("pipeline abort: {err}");
        }
        self.fail.set(err);
        {
            let _guard = self.m2s.free.lock().unwrap();
            self.m2s.avail.notify_all();
        }
        {
            let _guard = self.sw2w.state.lock().unwrap();
            self.sw2w.proceed.notify_all();
        }
        {
            let _guard = self.w2m.state.lock().unwrap();
            self.w2m.wake.notify_all();
        }
    }

    /// Drops one holder of `chunk`; the last holder out returns the slot
    /// credit to the splitter (via the muxer's release batch).
    pub fn release_chunk(&self, chunk: &Arc<SChunk>) {
        let st = self.sw2w.state.lock().unwrap();
        let before = chunk.refno.fetch_sub(1, MemOrder::AcqRel);
        debug_assert!(before > 0);
        drop(st);
        if before == 1 {
            log::trace!("chunk {} released", chunk.id);
            self.w2m.add_release();
        }
    }
}
