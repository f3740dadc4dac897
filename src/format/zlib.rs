//! Minimal RAII wrapper around a zlib inflate stream.
//!
//! The safe `flate2` API cannot stop at deflate block boundaries, report the
//! pending bit count, prime a raw stream with leftover bits, or install a
//! dictionary on a raw stream, and the gzip indexer needs all four. We talk to
//! zlib through `libz-sys` instead and keep every raw pointer inside
//! [`Inflater`], which owns a heap-pinned `z_stream` and ends it on drop.

use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr;

use libz_sys as z;

/// Window bits for a raw deflate stream with a 32 KiB window.
const RAW_WINDOW_BITS: c_int = -15;
/// Window bits for a gzip-wrapped stream with a 32 KiB window.
const GZIP_WINDOW_BITS: c_int = 15 + 16;

#[derive(Debug, Clone)]
pub struct ZlibError {
    pub code: c_int,
    pub message: String,
}

impl fmt::Display for ZlibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zlib error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ZlibError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Decode as much as possible.
    None,
    /// Stop at the end of the gzip header and after every deflate block.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    StreamEnd,
    /// No progress was possible with the buffers given.
    BufError,
}

/// Outcome of one [`Inflater::inflate`] call.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub consumed: usize,
    pub produced: usize,
    pub status: Status,
}

unsafe extern "C" fn zalloc(_opaque: z::voidpf, items: z::uInt, size: z::uInt) -> z::voidpf {
    libc::calloc(items as libc::size_t, size as libc::size_t) as z::voidpf
}

unsafe extern "C" fn zfree(_opaque: z::voidpf, address: z::voidpf) {
    libc::free(address as *mut c_void)
}

/// An initialised inflate stream.
///
/// zlib keeps a back pointer to the `z_stream`, so it lives in a `Box` and
/// never moves for the lifetime of the wrapper.
pub struct Inflater {
    strm: Box<z::z_stream>,
}

impl Inflater {
    /// Raw deflate data, no header or trailer.
    pub fn raw() -> Result<Self, ZlibError> {
        Self::with_window_bits(RAW_WINDOW_BITS)
    }

    /// A gzip member: header, deflate data, trailer.
    pub fn gzip() -> Result<Self, ZlibError> {
        Self::with_window_bits(GZIP_WINDOW_BITS)
    }

    fn with_window_bits(bits: c_int) -> Result<Self, ZlibError> {
        let mut strm = Box::new(z::z_stream {
            next_in: ptr::null_mut(),
            avail_in: 0,
            total_in: 0,
            next_out: ptr::null_mut(),
            avail_out: 0,
            total_out: 0,
            msg: ptr::null_mut(),
            state: ptr::null_mut(),
            zalloc,
            zfree,
            opaque: ptr::null_mut(),
            data_type: 0,
            adler: 0,
            reserved: 0,
        });
        let code = unsafe {
            z::inflateInit2_(
                &mut *strm,
                bits,
                z::zlibVersion(),
                mem::size_of::<z::z_stream>() as c_int,
            )
        };
        if code != z::Z_OK {
            return Err(ZlibError { code, message: "inflateInit2 failed".to_string() });
        }
        Ok(Self { strm })
    }

    /// Feed the low `bits` bits of `value` into the stream ahead of any input.
    pub fn prime(&mut self, bits: u8, value: u8) -> Result<(), ZlibError> {
        let code = unsafe { z::inflatePrime(&mut *self.strm, c_int::from(bits), c_int::from(value)) };
        self.check(code).map(|_| ())
    }

    /// Install the window preceding the data. Raw streams only.
    pub fn set_dictionary(&mut self, dict: &[u8]) -> Result<(), ZlibError> {
        let code =
            unsafe { z::inflateSetDictionary(&mut *self.strm, dict.as_ptr(), dict.len() as c_uint) };
        self.check(code).map(|_| ())
    }

    /// Decode from `input` into `output`.
    pub fn inflate(&mut self, input: &[u8], output: &mut [u8], flush: Flush) -> Result<Step, ZlibError> {
        let avail_in = input.len().min(c_uint::MAX as usize);
        let avail_out = output.len().min(c_uint::MAX as usize);
        self.strm.next_in = input.as_ptr() as *mut u8;
        self.strm.avail_in = avail_in as c_uint;
        self.strm.next_out = output.as_mut_ptr();
        self.strm.avail_out = avail_out as c_uint;

        let mode = match flush {
            Flush::None => z::Z_NO_FLUSH,
            Flush::Block => z::Z_BLOCK,
        };
        let code = unsafe { z::inflate(&mut *self.strm, mode) };

        let consumed = avail_in - self.strm.avail_in as usize;
        let produced = avail_out - self.strm.avail_out as usize;
        // Input and output buffers are only borrowed for this call.
        self.strm.next_in = ptr::null_mut();
        self.strm.avail_in = 0;
        self.strm.next_out = ptr::null_mut();
        self.strm.avail_out = 0;

        let status = self.check(code)?;
        Ok(Step { consumed, produced, status })
    }

    /// Stream position flags after the last call: the count of unused bits in
    /// the last consumed byte (low 3 bits), 64 while in the final deflate block,
    /// and 128 when stopped right after a block or the gzip header.
    pub fn data_type(&self) -> c_int {
        self.strm.data_type
    }

    fn check(&self, code: c_int) -> Result<Status, ZlibError> {
        match code {
            z::Z_OK => Ok(Status::Ok),
            z::Z_STREAM_END => Ok(Status::StreamEnd),
            z::Z_BUF_ERROR => Ok(Status::BufError),
            _ => {
                let message = if self.strm.msg.is_null() {
                    match code {
                        z::Z_NEED_DICT => "dictionary required".to_string(),
                        z::Z_MEM_ERROR => "out of memory".to_string(),
                        _ => "invalid stream".to_string(),
                    }
                } else {
                    unsafe { CStr::from_ptr(self.strm.msg) }.to_string_lossy().into_owned()
                };
                Err(ZlibError { code, message })
            }
        }
    }
}

impl Drop for Inflater {
    fn drop(&mut self) {
        unsafe {
            z::inflateEnd(&mut *self.strm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn inflate_all(inf: &mut Inflater, input: &[u8], cap: usize) -> Vec<u8> {
        let mut out = vec![0u8; cap];
        let mut pos_in = 0;
        let mut pos_out = 0;
        loop {
            let step = inf.inflate(&input[pos_in..], &mut out[pos_out..], Flush::None).unwrap();
            pos_in += step.consumed;
            pos_out += step.produced;
            if step.status == Status::StreamEnd {
                break;
            }
            assert!(step.consumed > 0 || step.produced > 0, "no progress");
        }
        out.truncate(pos_out);
        out
    }

    #[test]
    fn raw_roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(100);
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&data).unwrap();
        let compressed = enc.finish().unwrap();

        let mut inf = Inflater::raw().unwrap();
        assert_eq!(inflate_all(&mut inf, &compressed, data.len() + 16), data);
    }

    #[test]
    fn gzip_block_mode_stops_after_header() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"abc").unwrap();
        let compressed = enc.finish().unwrap();

        let mut inf = Inflater::gzip().unwrap();
        let mut out = [0u8; 16];
        let step = inf.inflate(&compressed, &mut out, Flush::Block).unwrap();
        assert_eq!(step.produced, 0);
        assert_eq!(step.consumed, 10);
        assert_ne!(inf.data_type() & 128, 0);
    }

    #[test]
    fn garbage_is_an_error() {
        let mut inf = Inflater::raw().unwrap();
        let mut out = [0u8; 16];
        // Block type 3 is reserved.
        assert!(inf.inflate(&[0xff, 0xff, 0xff], &mut out, Flush::None).is_err());
    }
}
