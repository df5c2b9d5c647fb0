//! Zlib compression filters.
//!
//! Two variants with distinct wire ids:
//!
//! - **Stateless**: every `write` call produces a self-contained zlib
//!   stream. The read side detects each stream end and resets, so frames
//!   can be decoded even if earlier frames were lost (UDP-style use).
//! - **Stateful**: one zlib stream spans the whole connection; each `write`
//!   ends with a sync flush so the peer can decode the frame immediately.
//!   Better ratios on many small messages, but only valid on a lossless
//!   ordered transport.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::buffer::{concat, ByteBuffer};
use crate::error::{Error, Result};
use crate::filter::{filter_ids, Filter, FilterFactory, FilterId};

const SCRATCH_LEN: usize = 4096;

fn run_compress(c: &mut Compress, data: &[u8], finish: bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut input = data;
    let mut scratch = vec![0u8; SCRATCH_LEN];
    loop {
        let flush = if !input.is_empty() {
            FlushCompress::None
        } else if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::Sync
        };
        let before_in = c.total_in();
        let before_out = c.total_out();
        let status = c
            .compress(input, &mut scratch, flush)
            .map_err(|e| Error::filter(format!("zlib compress: {e}")))?;
        let consumed = (c.total_in() - before_in) as usize;
        let produced = (c.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
        input = &input[consumed..];

        if finish {
            if status == Status::StreamEnd {
                break;
            }
        } else if input.is_empty() && produced < scratch.len() {
            // Sync flush drained: the scratch buffer was not filled, so
            // zlib has nothing further pending.
            break;
        }
    }
    Ok(out)
}

fn run_decompress(
    d: &mut Decompress,
    data: &[u8],
    out: &mut Vec<u8>,
    reset_at_stream_end: bool,
) -> Result<()> {
    let mut input = data;
    let mut scratch = vec![0u8; SCRATCH_LEN];
    while !input.is_empty() {
        let before_in = d.total_in();
        let before_out = d.total_out();
        let status = d
            .decompress(input, &mut scratch, FlushDecompress::None)
            .map_err(|e| Error::filter(format!("zlib decompress: {e}")))?;
        let consumed = (d.total_in() - before_in) as usize;
        let produced = (d.total_out() - before_out) as usize;
        out.extend_from_slice(&scratch[..produced]);
        input = &input[consumed..];

        match status {
            Status::StreamEnd => {
                if reset_at_stream_end {
                    d.reset(true);
                } else if !input.is_empty() {
                    return Err(Error::filter("zlib: data after end of stream"));
                }
            }
            Status::Ok => {}
            Status::BufError => {
                if consumed == 0 && produced == 0 {
                    // No progress without more input; wait for the next
                    // read completion.
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Stateless zlib: one complete stream per outgoing frame.
pub struct ZlibStatelessFilter {
    inflater: Decompress,
}

impl ZlibStatelessFilter {
    pub fn new() -> Self {
        ZlibStatelessFilter {
            inflater: Decompress::new(true),
        }
    }
}

impl Default for ZlibStatelessFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ZlibStatelessFilter {
    fn filter_id(&self) -> FilterId {
        filter_ids::ZLIB_STATELESS
    }

    fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()> {
        let flat = concat(input);
        let mut deflater = Compress::new(Compression::default(), true);
        let compressed = run_compress(&mut deflater, flat.as_slice(), true)?;
        out.push(ByteBuffer::from_vec(compressed));
        Ok(())
    }

    fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        run_decompress(&mut self.inflater, input, out, true)
    }

    fn reset(&mut self) {
        self.inflater.reset(true);
    }
}

/// Stateful zlib: a single stream for the connection lifetime, sync-flushed
/// at every frame boundary.
pub struct ZlibStatefulFilter {
    deflater: Compress,
    inflater: Decompress,
}

impl ZlibStatefulFilter {
    pub fn new() -> Self {
        ZlibStatefulFilter {
            deflater: Compress::new(Compression::default(), true),
            inflater: Decompress::new(true),
        }
    }
}

impl Default for ZlibStatefulFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ZlibStatefulFilter {
    fn filter_id(&self) -> FilterId {
        filter_ids::ZLIB_STATEFUL
    }

    fn write(&mut self, input: &[ByteBuffer], out: &mut Vec<ByteBuffer>) -> Result<()> {
        let flat = concat(input);
        let compressed = run_compress(&mut self.deflater, flat.as_slice(), false)?;
        out.push(ByteBuffer::from_vec(compressed));
        Ok(())
    }

    fn read(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        run_decompress(&mut self.inflater, input, out, false)
    }

    fn reset(&mut self) {
        self.deflater.reset();
        self.inflater.reset(true);
    }
}

pub struct ZlibStatelessFilterFactory;

impl FilterFactory for ZlibStatelessFilterFactory {
    fn filter_id(&self) -> FilterId {
        filter_ids::ZLIB_STATELESS
    }

    fn create_filter(&self) -> Box<dyn Filter> {
        Box::new(ZlibStatelessFilter::new())
    }
}

pub struct ZlibStatefulFilterFactory;

impl FilterFactory for ZlibStatefulFilterFactory {
    fn filter_id(&self) -> FilterId {
        filter_ids::ZLIB_STATEFUL
    }

    fn create_filter(&self) -> Box<dyn Filter> {
        Box::new(ZlibStatefulFilter::new())
    }
}
