//! Predictive integer decoder.
//!
//! Values are coded as a corrector against a predictor the decoder can
//! compute on its own. The corrector is split into a bucket number `k`
//! (roughly its bit width) coded with one adaptive model per context, and the
//! position inside the bucket coded with a per `k` model, falling back to raw
//! low bits once buckets get large.

use super::decoder::ArithmeticDecoder;
use super::models::{ArithmeticBitModel, ArithmeticModel};
use std::io;

pub const DEFAULT_BITS_HIGH: u32 = 8;

/// Decompresses signed integers as predictor plus corrector.
#[derive(Debug)]
pub struct IntegerDecompressor {
    contexts: u32,
    bits_high: u32,

    corr_bits: u32,
    corr_range: u32,
    corr_min: i32,

    /// Bucket number of the last corrector, fed back as context by callers.
    k: u32,

    m_bits: Vec<ArithmeticModel>,
    m_corrector0: ArithmeticBitModel,
    m_corrector: Vec<ArithmeticModel>,
}

impl IntegerDecompressor {
    fn new(bits: u32, contexts: u32, bits_high: u32, range: u32) -> Self {
        let corr_bits;
        let corr_range;
        let corr_min: i32;
        if range != 0 {
            // the corrector lives in a bounded interval
            let mut bits_needed = 0u32;
            let mut r = range;
            while r != 0 {
                r >>= 1;
                bits_needed += 1;
            }
            corr_bits = if range == (1 << (bits_needed - 1)) {
                bits_needed - 1
            } else {
                bits_needed
            };
            corr_range = range;
            corr_min = -((corr_range / 2) as i32);
        } else if bits != 0 && bits < 32 {
            corr_bits = bits;
            corr_range = 1u32 << bits;
            corr_min = -((corr_range / 2) as i32);
        } else {
            corr_bits = 32;
            corr_range = 0;
            corr_min = i32::MIN;
        }

        Self {
            contexts,
            bits_high,
            corr_bits,
            corr_range,
            corr_min,
            k: 0,
            m_bits: Vec::new(),
            m_corrector0: ArithmeticBitModel::new(),
            m_corrector: Vec::new(),
        }
    }

    /// Creates the per context bucket models and the per bucket corrector
    /// models. Separate from construction so unused decompressors stay cheap.
    pub fn init(&mut self) {
        if !self.m_bits.is_empty() {
            return;
        }
        self.m_bits = (0..self.contexts)
            .map(|_| ArithmeticModel::new(self.corr_bits + 1))
            .collect();
        self.m_corrector0.init();
        self.m_corrector = (1..=self.corr_bits)
            .map(|k| {
                let symbols = if k <= self.bits_high {
                    1 << k
                } else {
                    1 << self.bits_high
                };
                ArithmeticModel::new(symbols)
            })
            .collect();
    }

    /// Bucket number of the most recent corrector.
    pub fn k(&self) -> u32 {
        self.k
    }

    /// Decodes the next value as `pred` plus the coded corrector, folded
    /// back into `[0, corr_range)` the way the encoder folded the corrector.
    pub fn decompress(
        &mut self,
        decoder: &mut ArithmeticDecoder,
        pred: i32,
        context: u32,
    ) -> io::Result<i32> {
        debug_assert!(context < self.contexts);
        let corr = self.read_corrector(decoder, context)?;
        let mut real = pred.wrapping_add(corr);
        if real < 0 {
            real = real.wrapping_add(self.corr_range as i32);
        } else if real as u32 >= self.corr_range {
            // a zero range means the full 32 bits, the subtraction is a no-op
            real = real.wrapping_sub(self.corr_range as i32);
        }
        Ok(real)
    }

    fn read_corrector(
        &mut self,
        decoder: &mut ArithmeticDecoder,
        context: u32,
    ) -> io::Result<i32> {
        self.k = decoder.decode_symbol(&mut self.m_bits[context as usize])?;
        if self.k == 0 {
            // corrector is 0 or 1
            return Ok(decoder.decode_bit(&mut self.m_corrector0)? as i32);
        }
        if self.k >= 32 {
            return Ok(self.corr_min);
        }
        let k = self.k;
        let mut c = if k <= self.bits_high {
            // the whole bucket position fits one symbol
            decoder.decode_symbol(&mut self.m_corrector[k as usize - 1])? as i32
        } else {
            // high part from the model, low bits raw
            let k1 = k - self.bits_high;
            let high = decoder.decode_symbol(&mut self.m_corrector[k as usize - 1])? as i32;
            let low = decoder.read_bits(k1)? as i32;
            (high << k1) | low
        };
        // translate back into the signed interval around zero
        if c >= (1 << (k - 1)) {
            c += 1;
        } else {
            c -= (1 << k) - 1;
        }
        Ok(c)
    }
}

/// Builder matching the construction sites in the point decompressors.
#[derive(Debug, Default)]
pub struct IntegerDecompressorBuilder {
    bits: u32,
    contexts: u32,
    bits_high: u32,
    range: u32,
}

impl IntegerDecompressorBuilder {
    pub fn new() -> Self {
        Self {
            bits: 16,
            contexts: 1,
            bits_high: DEFAULT_BITS_HIGH,
            range: 0,
        }
    }

    pub fn bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    pub fn contexts(mut self, contexts: u32) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn build_initialized(self) -> IntegerDecompressor {
        let mut decompressor =
            IntegerDecompressor::new(self.bits, self.contexts, self.bits_high, self.range);
        decompressor.init();
        decompressor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::laz::source::ByteSource;
    use crate::laz::test_encoder::{ArithmeticEncoder, IntegerCompressor};

    #[test]
    fn corrector_interval_for_32_bits() {
        let id = IntegerDecompressorBuilder::new().bits(32).build_initialized();
        assert_eq!(id.corr_bits, 32);
        assert_eq!(id.corr_range, 0);
        assert_eq!(id.corr_min, i32::MIN);
        assert_eq!(id.m_bits[0].symbols, 33);
        assert_eq!(id.m_corrector.len(), 32);
        // small buckets are fully modeled, large ones keep 8 modeled bits
        assert_eq!(id.m_corrector[3].symbols, 16);
        assert_eq!(id.m_corrector[20].symbols, 256);
    }

    #[test]
    fn corrector_interval_for_16_bits() {
        let id = IntegerDecompressorBuilder::new().bits(16).build_initialized();
        assert_eq!(id.corr_bits, 16);
        assert_eq!(id.corr_range, 1 << 16);
        assert_eq!(id.corr_min, -(1 << 15));
    }

    #[test]
    fn roundtrip_against_reference_compressor() {
        let values: Vec<i32> = vec![
            0, 1, -1, 2, 5, 1000, -1000, 123_456, -654_321, 42, 0, 7, -7, 1 << 20, -(1 << 20),
            255, 256, -255, -256, 65_535, -65_536, 1 << 28, -(1 << 28),
        ];
        let mut encoder = ArithmeticEncoder::new();
        let mut ic = IntegerCompressor::new(32, 2);
        let mut pred = 0i32;
        for (i, &v) in values.iter().enumerate() {
            ic.compress(&mut encoder, pred, v, (i % 2) as u32);
            pred = v;
        }
        let bytes = encoder.done();

        let mut decoder = ArithmeticDecoder::new(ByteSource::new(bytes));
        decoder.read_init_bytes().unwrap();
        let mut id = IntegerDecompressorBuilder::new()
            .bits(32)
            .contexts(2)
            .build_initialized();
        let mut pred = 0i32;
        for (i, &v) in values.iter().enumerate() {
            let decoded = id.decompress(&mut decoder, pred, (i % 2) as u32).unwrap();
            assert_eq!(decoded, v, "value {i} did not survive the roundtrip");
            pred = v;
        }
    }

    #[test]
    fn roundtrip_16_bit_wraps_into_range() {
        let values: Vec<i32> = (0..200).map(|i| (i * 331) % 65_536).collect();
        let mut encoder = ArithmeticEncoder::new();
        let mut ic = IntegerCompressor::new(16, 1);
        let mut pred = 0i32;
        for &v in &values {
            ic.compress(&mut encoder, pred, v, 0);
            pred = v;
        }
        let bytes = encoder.done();

        let mut decoder = ArithmeticDecoder::new(ByteSource::new(bytes));
        decoder.read_init_bytes().unwrap();
        let mut id = IntegerDecompressorBuilder::new()
            .bits(16)
            .contexts(1)
            .build_initialized();
        let mut pred = 0i32;
        for &v in &values {
            let decoded = id.decompress(&mut decoder, pred, 0).unwrap();
            assert_eq!(decoded, v);
            pred = v;
        }
    }
}
