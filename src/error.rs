use std::io;
use thiserror::Error;

/// Fatal pipeline errors. None of these are recoverable: the pipeline stops
/// at the first one and never reports truncated output as success.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A full input chunk was scanned to the end without finding a bzip2
    /// block header. `0` is "full first" or "full second", matching which of
    /// the two chunks a scan may touch.
    #[error("missing bzip2 block header in {0} input block")]
    MissingBlockHeader(&'static str),

    /// A bzip2 block ran past the end of the input, or past the two-chunk
    /// window a single scan is allowed to cover.
    #[error("unterminated bzip2 block in {0} input block")]
    UnterminatedBlock(&'static str),

    /// The block codec rejected the block contents.
    #[error("data error while decompressing block: {0}")]
    BlockData(String),

    /// The rotated XOR of the per-block CRCs did not match the CRC stored in
    /// the stream's end-of-stream marker.
    #[error("stream CRC mismatch")]
    StreamCrcMismatch,

    /// A block's size class exceeds the bs100k its stream declared.
    #[error("block overrun")]
    BlockOverrun,

    /// The input ended without a single real stream (at most end-of-stream
    /// markers or garbage).
    #[error("not a valid bzip2 file")]
    NotBzip2,

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Another pipeline thread hit a fatal error first; this thread only
    /// tore down. The first error is the one reported to the caller.
    #[error("pipeline aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
