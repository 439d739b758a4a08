//! End-to-end pipeline tests. All inputs are generated in-process with the
//! bzip2 encoder, so every scenario is deterministic and self-contained.

use pbzcat::{decompress, Options, PipelineError};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io::Write;

const MIB: usize = 1024 * 1024;

fn compress(data: &[u8], level: u32) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(level));
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn run(input: &[u8], workers: usize, slots: usize) -> Result<Vec<u8>, PipelineError> {
    let mut out = Vec::new();
    decompress(input, &mut out, &Options { workers, slots }).map(|()| out)
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

fn lorem(len: usize) -> Vec<u8> {
    b"Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do \
eiusmod tempor incididunt ut labore et dolore magna aliqua. "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

#[test]
fn single_small_stream() {
    let data = lorem(500 * 1024);
    let out = run(&compress(&data, 9), 4, 8).unwrap();
    assert_eq!(out, data);
}

#[test]
fn single_stream_one_worker() {
    let data = lorem(300 * 1024);
    let out = run(&compress(&data, 9), 1, 2).unwrap();
    assert_eq!(out, data);
}

#[test]
fn multi_stream_concatenation() {
    // Stream A: one block at bs100k=9. Stream B: three blocks at bs100k=1.
    let a = lorem(400 * 1024);
    let b = random_bytes(220 * 1024, 11);
    let mut input = compress(&a, 9);
    input.extend_from_slice(&compress(&b, 1));

    let out = run(&input, 4, 8).unwrap();
    let mut expected = a;
    expected.extend_from_slice(&b);
    assert_eq!(out, expected);
}

#[test]
fn multi_block_stream_has_bit_aligned_headers() {
    // More than 20 blocks at bs100k=1; every header after the first sits at
    // an arbitrary bit offset.
    let data = random_bytes(2 * MIB + 12345, 22);
    let out = run(&compress(&data, 1), 4, 8).unwrap();
    assert_eq!(out, data);
}

#[test]
fn cross_chunk_block() {
    // Incompressible input makes the compressed stream larger than one
    // chunk, so blocks straddle the 1 MiB chunk boundary.
    let data = random_bytes(3 * MIB, 33);
    let input = compress(&data, 1);
    assert!(input.len() > pbzcat::CHUNK_BYTES);

    for workers in [1, 4] {
        let out = run(&input, workers, workers * 4).unwrap();
        assert_eq!(out, data);
    }
}

#[test]
fn minimum_slots_make_progress() {
    // Every scan may hold its chunk while waiting for the successor, so the
    // pipeline enforces a floor of workers + 1 slots. Asking for fewer must
    // still terminate.
    let data = random_bytes(2 * MIB + 777, 44);
    let input = compress(&data, 1);
    assert!(input.len() > pbzcat::CHUNK_BYTES);
    let out = run(&input, 2, 1).unwrap();
    assert_eq!(out, data);
}

#[test]
fn output_identical_for_any_worker_and_slot_count() {
    let data = random_bytes(600 * 1024, 55);
    let input = compress(&data, 1);
    for workers in [1, 2, 4] {
        for slots in [2, 3, 8] {
            let out = run(&input, workers, slots).unwrap();
            assert_eq!(out, data, "workers={workers} slots={slots}");
        }
    }
}

#[test]
fn one_block_expands_to_many_sub_blocks() {
    // Run-length expansion: a single tiny block decompresses to 4 MiB, so
    // the muxer has to stitch several 1 MiB sub-blocks of one block.
    let data = vec![0u8; 4 * MIB];
    let input = compress(&data, 9);
    assert!(input.len() < 4096);
    let out = run(&input, 4, 8).unwrap();
    assert_eq!(out, data);
}

#[test]
fn empty_payload_stream() {
    // bzip2 of empty input: a stream header followed directly by the
    // end-of-stream marker with an all-zero CRC.
    let out = run(&compress(b"", 9), 2, 4).unwrap();
    assert!(out.is_empty());
}

#[test]
fn trailing_garbage_is_ignored() {
    let data = lorem(100 * 1024);
    let mut input = compress(&data, 9);
    input.extend_from_slice(b"\0\0trailing junk that is not bzip2");
    let out = run(&input, 4, 8).unwrap();
    assert_eq!(out, data);
}

#[test]
fn corrupt_stream_crc_is_fatal() {
    let data = lorem(150 * 1024);
    let mut input = compress(&data, 9);
    // The stored stream CRC sits in the last handful of bytes, right after
    // the end-of-stream magic.
    let n = input.len();
    input[n - 2] ^= 0x55;

    let mut out = Vec::new();
    let err = decompress(&input[..], &mut out, &Options { workers: 4, slots: 8 }).unwrap_err();
    assert!(matches!(err, PipelineError::StreamCrcMismatch), "got {err}");
    // Whatever was written is a correct prefix of the real output.
    assert!(out.len() <= data.len());
    assert_eq!(out, data[..out.len()]);
}

#[test]
fn missing_header_in_full_first_chunk() {
    // A full chunk of bytes that contain no block header at all.
    let input = vec![0xAAu8; MIB];
    let err = run(&input, 2, 4).unwrap_err();
    assert!(matches!(err, PipelineError::MissingBlockHeader("full first")), "got {err}");
}

#[test]
fn short_garbage_is_not_bzip2() {
    let err = run(b"this is not a bzip2 file", 2, 4).unwrap_err();
    assert!(matches!(err, PipelineError::NotBzip2), "got {err}");
}

#[test]
fn empty_input_is_not_bzip2() {
    let err = run(b"", 2, 4).unwrap_err();
    assert!(matches!(err, PipelineError::NotBzip2), "got {err}");
}

#[test]
fn corrupt_block_payload_is_fatal() {
    let data = lorem(200 * 1024);
    let mut input = compress(&data, 9);
    // Damage the Huffman payload well inside the block.
    let mid = input.len() / 2;
    input[mid] ^= 0x40;
    let err = run(&input, 4, 8).unwrap_err();
    assert!(
        matches!(err, PipelineError::BlockData(_) | PipelineError::StreamCrcMismatch),
        "got {err}"
    );
}

#[test]
fn stream_boundary_positions_do_not_matter() {
    // Concatenate many tiny streams so stream transitions land at assorted
    // offsets relative to chunk and word boundaries.
    let mut input = Vec::new();
    let mut expected = Vec::new();
    for i in 0..40u32 {
        let piece = lorem(1000 + (i as usize) * 37);
        input.extend_from_slice(&compress(&piece, 1 + (i % 9)));
        expected.extend_from_slice(&piece);
    }
    let out = run(&input, 4, 8).unwrap();
    assert_eq!(out, expected);
}
