//! Scanning and block retrieval: the producer half of a worker.
//!
//! A scan owns one s-chunk and cuts bzip2 blocks out of it. The last block
//! whose header lies in this chunk may continue into the successor chunk
//! (never further: a compressed block is smaller than a chunk), so the
//! retriever can hold up to two chunks at a time. Between blocks it walks
//! the 16-bit-aligned trailer sequence (block CRC, end-of-stream marker,
//! stream CRC, next stream header) with an explicit state machine that
//! crosses chunk boundaries the same way the bit-level retrieval does.

use crate::bits::BitCursor;
use crate::decoder::{BlockDecoder, Retrieve};
use crate::error::{PipelineError, Result};
use crate::queue::{DecodeJob, JobId, SChunk, Shared, StreamMark};
use crate::scanner::{self, MAGIC_BITS};
use crate::worker;
use crate::CHUNK_WORDS;
use std::sync::Arc;

/// Scans one s-chunk for bzip2 blocks and retrieves every block whose
/// header lies inside it.
pub fn scan(shared: &Shared, chunk: Arc<SChunk>) -> Result<()> {
    debug_assert!(!chunk.words.is_empty());
    if chunk.id == 1 {
        // The first chunk carries no predecessor's tail: it must open with
        // a stream header. The trailer state machine doubles as the scanner
        // and the stream metadata travels as a decoder-less marker job.
        log::trace!("scanning chunk 1 (stream head)");
        return Retriever::new(shared, chunk, BitCursor::new(), true).run();
    }
    match scanner::find_block_magic(&chunk.words) {
        Some(hit) => {
            log::trace!(
                "chunk {}: block header ends at bit {}",
                chunk.id,
                hit.pos * 32 - hit.bits_left as usize
            );
            let cur = BitCursor::at(hit.pos, hit.word, hit.bits_left);
            Retriever::new(shared, chunk, cur, false).run()
        }
        None if chunk.is_full() => Err(PipelineError::MissingBlockHeader("full first")),
        None => {
            // A short chunk (the last one) with no block header only holds
            // the predecessor's tail; nothing to scan.
            log::trace!("chunk {}: no block header in final chunk", chunk.id);
            shared.release_chunk(&chunk);
            Ok(())
        }
    }
}

/// A decode job under construction.
struct PendingJob {
    decoder: Option<BlockDecoder>,
    mark: StreamMark,
    stream_crc: u32,
    end_offs: u64,
}

impl PendingJob {
    fn marker() -> Self {
        PendingJob { decoder: None, mark: StreamMark::Unchanged, stream_crc: 0, end_offs: 0 }
    }

    fn block() -> Self {
        PendingJob { decoder: Some(BlockDecoder::new()), ..Self::marker() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

#[derive(Debug, Clone, Copy)]
enum Trailer {
    Crc1,
    Crc2,
    StreamMagic1,
    StreamMagic2,
    BlockMagic1,
    BlockMagic2,
    BlockMagic3,
    Eos2,
    Eos3,
    EosCrc1,
    EosCrc2,
}

struct Retriever<'a> {
    shared: &'a Shared,
    chunk: Option<Arc<SChunk>>,
    cur: BitCursor,
    /// Still on the chunk this scan started with.
    first: bool,
    /// s_id stamped on every job this scan emits.
    scan_id: u64,
    bz_id: u64,
    job: PendingJob,
    /// A block header has been matched at least once. Only the first scan
    /// starts with this unset; it gates the missing-header diagnosis.
    matched: bool,
}

impl<'a> Retriever<'a> {
    fn new(shared: &'a Shared, chunk: Arc<SChunk>, cur: BitCursor, stream_head: bool) -> Self {
        let scan_id = chunk.id;
        Retriever {
            shared,
            chunk: Some(chunk),
            cur,
            first: true,
            scan_id,
            bz_id: 0,
            job: if stream_head { PendingJob::marker() } else { PendingJob::block() },
            matched: !stream_head,
        }
    }

    fn run(mut self) -> Result<()> {
        if self.job.decoder.is_none() {
            // Stream head: find the first real block before retrieving.
            if self.trailer(Trailer::StreamMagic1)? == Step::Finished {
                return Ok(());
            }
        }
        loop {
            let status = {
                let chunk = self.chunk.as_ref().unwrap();
                let decoder = self.job.decoder.as_mut().unwrap();
                decoder.retrieve(&chunk.words, &mut self.cur)
            };
            let step = match status {
                Retrieve::Block => self.boundary()?,
                Retrieve::StreamEnd => self.trailer(Trailer::Crc1)?,
                Retrieve::Underflow => {
                    self.second_chunk()?;
                    Step::Continue
                }
            };
            if step == Step::Finished {
                return Ok(());
            }
        }
    }

    /// A block (or the stream-head marker) is complete and the next block's
    /// header was just consumed. Flush it; once the next header lies fully
    /// inside the second chunk, that chunk's own scan takes over and this
    /// one ends. Releasing early keeps the splitter moving.
    fn boundary(&mut self) -> Result<Step> {
        self.job.end_offs = self.end_offs();
        if !self.first && self.next_scan_reaches() {
            let chunk = self.chunk.take().unwrap();
            self.shared.release_chunk(&chunk);
            self.flush(true);
            return Ok(Step::Finished);
        }
        self.flush(false);
        self.job = PendingJob::block();
        Ok(Step::Continue)
    }

    /// The next scan starts from the second chunk's first byte, so it will
    /// find any header that lies entirely inside that chunk.
    fn next_scan_reaches(&self) -> bool {
        (MAGIC_BITS as usize + self.cur.bits_left() as usize).div_ceil(8) <= 4 * self.cur.pos()
    }

    /// Retrieval ran out of chunk mid-block: step into the successor, or
    /// fail — a block must end within the second chunk.
    fn second_chunk(&mut self) -> Result<()> {
        let chunk = self.chunk.as_ref().unwrap();
        if !self.first {
            return Err(if chunk.is_full() {
                PipelineError::MissingBlockHeader("full second")
            } else {
                PipelineError::UnterminatedBlock("short second")
            });
        }
        if !chunk.is_full() {
            return Err(PipelineError::UnterminatedBlock("short first"));
        }
        let chunk = self.chunk.take().unwrap();
        match worker::get_second(self.shared, chunk)? {
            Some(next) => {
                log::trace!("scan {}: continuing into chunk {}", self.scan_id, next.id);
                self.chunk = Some(next);
                self.cur.rewind_words();
                self.first = false;
                Ok(())
            }
            None => Err(PipelineError::UnterminatedBlock("full first")),
        }
    }

    /// Walks the 16-bit-aligned trailer after a captured block (entry
    /// `Crc1`) or at the head of the input (entry `StreamMagic1`), until the
    /// next block header is accepted or the input ends.
    fn trailer(&mut self, entry: Trailer) -> Result<Step> {
        use Trailer::*;
        let mut state = entry;
        loop {
            let word = match self.next16()? {
                Some(w) => w,
                None => return Ok(Step::Finished),
            };
            state = match (state, word) {
                (Crc1, w) => {
                    self.job.stream_crc = u32::from(w) << 16;
                    Crc2
                }
                (Crc2, w) => {
                    self.job.stream_crc |= u32::from(w);
                    // Streams are zero-padded to a whole byte after the CRC.
                    self.cur.align_to_byte();
                    StreamMagic1
                }
                (StreamMagic1, 0x425A) => StreamMagic2,
                (StreamMagic2, w @ 0x6831..=0x6839) => {
                    self.job.mark = StreamMark::NewStream(u32::from(w & 15));
                    BlockMagic1
                }
                (BlockMagic1, 0x1772) => Eos2,
                (BlockMagic1, 0x3141) => BlockMagic2,
                (BlockMagic2, 0x5926) => BlockMagic3,
                (BlockMagic3, 0x5359) => {
                    self.matched = true;
                    return self.boundary();
                }
                (Eos2, 0x4538) => Eos3,
                (Eos3, 0x5090) => EosCrc1,
                // Only a zero-block stream puts its end marker here, and an
                // empty fold leaves its stream CRC at zero.
                (EosCrc1, 0) => EosCrc2,
                (EosCrc2, 0) => StreamMagic1,
                (st, w) => {
                    // Not part of any stream: trailing garbage, ignored up
                    // to the end of the chunk.
                    let chunk = self.chunk.as_ref().unwrap();
                    log::debug!("chunk {}: ignoring trailing garbage (word {w:#06x})", chunk.id);
                    self.cur.skip_chunk(chunk.words.len());
                    st
                }
            };
        }
    }

    /// Pulls the next 16 bits for the trailer scan, crossing into the
    /// successor chunk as needed. None means the scan finished at the end of
    /// the input (the pending job has been flushed).
    fn next16(&mut self) -> Result<Option<u16>> {
        loop {
            let chunk = self.chunk.as_ref().unwrap();
            if self.cur.fill(16, &chunk.words) {
                return Ok(Some(self.cur.take(16) as u16));
            }
            if self.chunk_exhausted()? == Step::Finished {
                return Ok(None);
            }
        }
    }

    /// The trailer scan ran out of bits in the current chunk: advance into
    /// the successor, or conclude the scan at end of input.
    fn chunk_exhausted(&mut self) -> Result<Step> {
        if self.job.mark == StreamMark::Unchanged {
            self.job.mark = StreamMark::Eos;
        }
        self.job.end_offs = self.end_offs();
        let chunk = self.chunk.as_ref().unwrap();

        if !self.first {
            if chunk.is_full() {
                return Err(PipelineError::MissingBlockHeader("full second"));
            }
            // The stream ended inside the short final chunk.
            let chunk = self.chunk.take().unwrap();
            self.shared.release_chunk(&chunk);
            self.flush(true);
            return Ok(Step::Finished);
        }

        if !self.matched && chunk.is_full() {
            // A whole chunk of leading input without a single block header
            // cannot be a bzip2 file.
            return Err(PipelineError::MissingBlockHeader("full first"));
        }

        let next = if chunk.is_full() {
            let chunk = self.chunk.take().unwrap();
            worker::get_second(self.shared, chunk)?
        } else {
            let chunk = self.chunk.take().unwrap();
            self.shared.release_chunk(&chunk);
            None
        };
        match next {
            Some(next) => {
                log::trace!("scan {}: trailer continues into chunk {}", self.scan_id, next.id);
                self.chunk = Some(next);
                self.cur.rewind_words();
                self.first = false;
                Ok(Step::Continue)
            }
            None => {
                self.flush(true);
                Ok(Step::Finished)
            }
        }
    }

    /// Stamps the pending job and hands it to the decode queue. The
    /// stream-head marker always gets id (0, 0), ahead of every real block.
    fn flush(&mut self, last_bz: bool) {
        let job = std::mem::replace(&mut self.job, PendingJob::marker());
        let id = if job.decoder.is_some() {
            let bz_id = self.bz_id;
            self.bz_id += 1;
            JobId { s_id: self.scan_id, bz_id, last_bz }
        } else {
            JobId { s_id: 0, bz_id: 0, last_bz: true }
        };
        self.shared.sw2w.push_job(DecodeJob {
            id,
            decoder: job.decoder,
            mark: job.mark,
            stream_crc: job.stream_crc,
            end_offs: job.end_offs,
        });
    }

    /// Input byte offset just past the cursor, at word granularity.
    fn end_offs(&self) -> u64 {
        let chunk = self.chunk.as_ref().unwrap();
        ((chunk.id - 1) * CHUNK_WORDS as u64 + self.cur.pos() as u64) * 4
    }
}
