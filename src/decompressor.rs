//! Chunk decompressor.
//!
//! Entry point for turning one COPC node's compressed chunk into LAS point
//! records. The point format decides the wire layout: format 0 is a single
//! arithmetic stream, formats 6/7/8 are layered into one stream per field
//! group.

use crate::error::{Error, Result};
use crate::laz::decoder::ArithmeticDecoder;
use crate::laz::point10::{Point10Decompressor, POINT10_SIZE};
use crate::laz::point14::Point14Decompressor;
use crate::laz::source::ByteSource;

/// Uncompressed record size of the supported point formats.
pub fn base_record_size(point_format: u8) -> Option<usize> {
    match point_format {
        0 => Some(20),
        6 => Some(30),
        7 => Some(36),
        8 => Some(38),
        _ => None,
    }
}

enum PointDecompressor {
    Point10 {
        decoder: ArithmeticDecoder,
        fields: Box<Point10Decompressor>,
        initialized: bool,
    },
    Point14(Box<Point14Decompressor>),
}

/// Decompresses the points of a single chunk, one record at a time.
///
/// A decode error leaves the decompressor unusable; the chunk cannot be
/// resumed mid-stream.
pub struct ChunkDecompressor {
    inner: PointDecompressor,
    point_size: usize,
    extra_bytes: usize,
    is_first: bool,
}

impl ChunkDecompressor {
    /// Sets up decompression of `bytes` for the given point format.
    ///
    /// `point_size` is the record length from the LAS header; everything
    /// beyond the base size of the format counts as extra bytes.
    pub fn open(point_format: u8, point_size: u16, bytes: Vec<u8>) -> Result<Self> {
        let unsupported = || Error::UnsupportedPointFormat {
            format: point_format,
            record_length: point_size,
        };
        let base = base_record_size(point_format).ok_or_else(unsupported)?;
        if (point_size as usize) < base {
            return Err(unsupported());
        }
        let extra_bytes = point_size as usize - base;

        let inner = match point_format {
            0 => PointDecompressor::Point10 {
                decoder: ArithmeticDecoder::new(ByteSource::new(bytes)),
                fields: Box::new(Point10Decompressor::new()),
                initialized: false,
            },
            _ => PointDecompressor::Point14(Box::new(
                Point14Decompressor::new(
                    bytes,
                    point_format >= 7,
                    point_format == 8,
                    extra_bytes,
                )
                .map_err(Error::from_decode_io)?,
            )),
        };

        Ok(Self {
            inner,
            point_size: point_size as usize,
            extra_bytes,
            is_first: true,
        })
    }

    /// Record size of the points this decompressor emits.
    pub fn point_size(&self) -> usize {
        self.point_size
    }

    /// Decompresses the next record into `out`, which must hold exactly
    /// [Self::point_size] bytes.
    pub fn decompress_next(&mut self, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.point_size);
        match &mut self.inner {
            PointDecompressor::Point10 {
                decoder,
                fields,
                initialized,
            } => {
                if self.is_first {
                    // the first record is stored raw, no decoder state yet
                    fields
                        .decompress_first(decoder.source_mut(), &mut out[..POINT10_SIZE])
                        .map_err(Error::from_decode_io)?;
                    if self.extra_bytes > 0 {
                        decoder
                            .source_mut()
                            .read_exact(&mut out[POINT10_SIZE..])
                            .map_err(Error::from_decode_io)?;
                    }
                    self.is_first = false;
                } else {
                    if !*initialized {
                        decoder.read_init_bytes().map_err(Error::from_decode_io)?;
                        *initialized = true;
                    }
                    fields
                        .decompress_with(decoder, &mut out[..POINT10_SIZE])
                        .map_err(Error::from_decode_io)?;
                    out[POINT10_SIZE..].fill(0);
                }
            }
            PointDecompressor::Point14(fields) => {
                if self.is_first {
                    fields.first_point(out);
                    self.is_first = false;
                } else {
                    fields.decompress_next(out).map_err(Error::from_decode_io)?;
                }
            }
        }
        Ok(())
    }

    /// Returns the next record as an owned buffer.
    pub fn get_point(&mut self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.point_size];
        self.decompress_next(&mut out)?;
        Ok(out)
    }

    /// Drops the decoder state. Decompression cannot continue afterwards.
    pub fn close(self) {}
}

/// Decompresses `count` records and returns them individually.
pub fn decompress_chunk(
    point_format: u8,
    point_size: u16,
    bytes: Vec<u8>,
    count: usize,
) -> Result<Vec<Vec<u8>>> {
    let mut decompressor = ChunkDecompressor::open(point_format, point_size, bytes)?;
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        points.push(decompressor.get_point()?);
    }
    decompressor.close();
    Ok(points)
}

/// Decompresses `count` records into one contiguous buffer.
pub fn decompress_chunk_flat(
    point_format: u8,
    point_size: u16,
    bytes: Vec<u8>,
    count: usize,
) -> Result<Vec<u8>> {
    let mut decompressor = ChunkDecompressor::open(point_format, point_size, bytes)?;
    let mut points = vec![0u8; count * point_size as usize];
    for record in points.chunks_exact_mut(point_size as usize) {
        decompressor.decompress_next(record)?;
    }
    decompressor.close();
    Ok(points)
}
