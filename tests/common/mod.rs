#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_lzo::{LZOContext, LZOError};

/// Text-like payload: words from a small vocabulary with occasional random
/// bytes, so every codec compresses it but not trivially.
pub fn sample_data(len: usize, seed: u64) -> Vec<u8> {
    const VOCAB: [&str; 12] = [
        "block ", "index ", "seek ", "window ", "stream ", "offset ", "cache ", "frame ", "member ", "deflate ",
        "zstd ", "\n",
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        if rng.gen_ratio(1, 20) {
            out.push(rng.gen());
        } else {
            out.extend_from_slice(VOCAB[rng.gen_range(0..VOCAB.len())].as_bytes());
        }
    }
    out.truncate(len);
    out
}

/// Seeded random bytes that no codec can shrink.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut out = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill(&mut out[..]);
    out
}

pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut enc = xz2::write::XzEncoder::new(Vec::new(), 3);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// A single xz stream holding one block per `block_size` bytes, as written
/// by multi-threaded encoders.
pub fn xz_blocks(data: &[u8], block_size: u64) -> Vec<u8> {
    let stream = xz2::stream::MtStreamBuilder::new()
        .threads(2)
        .block_size(block_size)
        .preset(3)
        .check(xz2::stream::Check::Crc64)
        .encoder()
        .unwrap();
    let mut enc = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// One xz stream per chunk, concatenated.
pub fn xz_streams(data: &[u8], chunk: usize) -> Vec<u8> {
    data.chunks(chunk).flat_map(xz).collect()
}

/// Independent zstd frames of `chunk` bytes followed by a seek table.
pub fn zstd_seekable(data: &[u8], chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut table = Vec::new();
    let mut frames = 0u32;
    for c in data.chunks(chunk) {
        let frame = zstd::bulk::compress(c, 3).unwrap();
        table.write_u32::<LittleEndian>(frame.len() as u32).unwrap();
        table.write_u32::<LittleEndian>(c.len() as u32).unwrap();
        table.write_u32::<LittleEndian>(xxhash_rust::xxh64::xxh64(c, 0) as u32).unwrap();
        out.extend(frame);
        frames += 1;
    }
    table.write_u32::<LittleEndian>(frames).unwrap();
    table.push(0x80);
    table.write_u32::<LittleEndian>(0x8f92_eab1).unwrap();
    out.write_u32::<LittleEndian>(0x184d_2a5e).unwrap();
    out.write_u32::<LittleEndian>(table.len() as u32).unwrap();
    out.extend(table);
    out
}

/// Plain concatenated zstd frames without a seek table.
pub fn zstd_frames(data: &[u8], chunk: usize) -> Vec<u8> {
    data.chunks(chunk).flat_map(|c| zstd::bulk::compress(c, 1).unwrap()).collect()
}

const LZOP_MAGIC: [u8; 9] = [0x89, b'L', b'Z', b'O', 0x00, b'\r', b'\n', 0x1a, b'\n'];
const F_ADLER32_D: u32 = 1 << 0;
const F_CRC32_C: u32 = 1 << 9;

/// An lzop member with LZO1X-1 compressed blocks of `chunk` bytes. Blocks
/// that do not shrink are stored, as lzop itself does.
pub fn lzop(data: &[u8], chunk: usize) -> Vec<u8> {
    let flags = F_ADLER32_D | F_CRC32_C;
    let mut header = Vec::new();
    header.write_u16::<BigEndian>(0x1030).unwrap();
    header.write_u16::<BigEndian>(0x2080).unwrap();
    header.write_u16::<BigEndian>(0x0940).unwrap();
    header.push(1);
    header.push(5);
    header.write_u32::<BigEndian>(flags).unwrap();
    header.write_u32::<BigEndian>(0o100644).unwrap();
    header.write_u32::<BigEndian>(0).unwrap();
    header.write_u32::<BigEndian>(0).unwrap();
    header.push(0);

    let mut out = LZOP_MAGIC.to_vec();
    out.extend_from_slice(&header);
    out.write_u32::<BigEndian>(adler::adler32_slice(&header)).unwrap();

    let mut ctx = LZOContext::new();
    for c in data.chunks(chunk) {
        let mut buf = vec![0u8; c.len() + c.len() / 16 + 64 + 3];
        let (compressed, err) = ctx.compress_to_slice(c, &mut buf);
        assert!(matches!(err, LZOError::OK));
        out.write_u32::<BigEndian>(c.len() as u32).unwrap();
        if compressed.len() < c.len() {
            out.write_u32::<BigEndian>(compressed.len() as u32).unwrap();
            out.write_u32::<BigEndian>(adler::adler32_slice(c)).unwrap();
            out.write_u32::<BigEndian>(crc32fast::hash(compressed)).unwrap();
            out.extend_from_slice(compressed);
        } else {
            out.write_u32::<BigEndian>(c.len() as u32).unwrap();
            out.write_u32::<BigEndian>(adler::adler32_slice(c)).unwrap();
            out.extend_from_slice(c);
        }
    }
    out.write_u32::<BigEndian>(0).unwrap();
    out
}

/// Random `(offset, len)` windows inside `size` bytes, some running past
/// the end.
pub fn random_windows(size: u64, count: usize, max_len: usize, seed: u64) -> Vec<(u64, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let offset = rng.gen_range(0..size);
            let len = rng.gen_range(1..=max_len);
            (offset, len)
        })
        .collect()
}
