//! Arithmetic range decoder.
//!
//! The decoder keeps a 32 bit window `value` inside a shrinking interval of
//! width `length`. Every decode narrows the interval; when it drops below
//! 2^24 the decoder pulls fresh bytes from the source. This is the exact
//! inverse of the FastAC based encoder LASzip files are written with, so
//! every shift and multiplication below is part of the file format.

use super::models::{ArithmeticBitModel, ArithmeticModel, BM_LENGTH_SHIFT, DM_LENGTH_SHIFT};
use super::source::ByteSource;
use std::io;

/// Lower bound of the interval width, renormalization threshold.
pub const AC_MIN_LENGTH: u32 = 0x0100_0000;
/// Initial interval width.
pub const AC_MAX_LENGTH: u32 = 0xFFFF_FFFF;

#[derive(Debug)]
pub struct ArithmeticDecoder {
    source: ByteSource,
    value: u32,
    length: u32,
}

impl ArithmeticDecoder {
    /// Creates a decoder; no bytes are consumed until [Self::read_init_bytes].
    pub fn new(source: ByteSource) -> Self {
        Self {
            source,
            value: 0,
            length: AC_MAX_LENGTH,
        }
    }

    /// Reads the four bytes that seed the decoder window.
    pub fn read_init_bytes(&mut self) -> io::Result<()> {
        self.value = (self.source.next_byte()? as u32) << 24;
        self.value |= (self.source.next_byte()? as u32) << 16;
        self.value |= (self.source.next_byte()? as u32) << 8;
        self.value |= self.source.next_byte()? as u32;
        self.length = AC_MAX_LENGTH;
        Ok(())
    }

    pub fn source_mut(&mut self) -> &mut ByteSource {
        &mut self.source
    }

    pub fn into_source(self) -> ByteSource {
        self.source
    }

    #[inline]
    fn renorm(&mut self) -> io::Result<()> {
        while self.length < AC_MIN_LENGTH {
            self.value = (self.value << 8) | self.source.next_byte()? as u32;
            self.length <<= 8;
        }
        Ok(())
    }

    /// Decodes one bit with an adaptive binary model.
    pub fn decode_bit(&mut self, model: &mut ArithmeticBitModel) -> io::Result<u32> {
        // product of the scaled probability and the interval width
        let x = model.bit_0_prob * (self.length >> BM_LENGTH_SHIFT);
        let sym = (self.value >= x) as u32;
        if sym == 0 {
            self.length = x;
            model.bit_0_count += 1;
        } else {
            self.value -= x;
            self.length -= x;
        }
        if self.length < AC_MIN_LENGTH {
            self.renorm()?;
        }
        model.bits_until_update -= 1;
        if model.bits_until_update == 0 {
            model.update();
        }
        Ok(sym)
    }

    /// Decodes one symbol with an adaptive multi symbol model.
    pub fn decode_symbol(&mut self, model: &mut ArithmeticModel) -> io::Result<u32> {
        let mut sym: u32;
        let mut n: u32;
        let x: u32;
        let mut y = self.length;

        if !model.decoder_table.is_empty() {
            self.length >>= DM_LENGTH_SHIFT;
            let dv = self.value / self.length;
            let t = (dv >> model.table_shift) as usize;
            // initial decision from the table, then finish with bisection
            sym = model.decoder_table[t];
            n = model.decoder_table[t + 1] + 1;
            while n > sym + 1 {
                let k = (sym + n) >> 1;
                if model.distribution[k as usize] > dv {
                    n = k;
                } else {
                    sym = k;
                }
            }
            x = model.distribution[sym as usize] * self.length;
            if sym != model.last_symbol {
                y = model.distribution[sym as usize + 1] * self.length;
            }
        } else {
            // decode via pure bisection
            sym = 0;
            let mut low = 0u32;
            self.length >>= DM_LENGTH_SHIFT;
            n = model.symbols;
            let mut k = n >> 1;
            loop {
                let z = self.length * model.distribution[k as usize];
                if z > self.value {
                    n = k;
                    y = z;
                } else {
                    sym = k;
                    low = z;
                }
                k = (sym + n) >> 1;
                if k == sym {
                    break;
                }
            }
            x = low;
        }

        self.value -= x;
        self.length = y - x;
        if self.length < AC_MIN_LENGTH {
            self.renorm()?;
        }
        model.symbol_count[sym as usize] += 1;
        model.symbols_until_update -= 1;
        if model.symbols_until_update == 0 {
            model.update();
        }
        Ok(sym)
    }

    /// Reads one raw bit, bypassing any model.
    pub fn read_bit(&mut self) -> io::Result<u32> {
        self.length >>= 1;
        let sym = self.value / self.length;
        self.value -= sym * self.length;
        if self.length < AC_MIN_LENGTH {
            self.renorm()?;
        }
        if sym >= 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "arithmetic decoder out of sync",
            ));
        }
        Ok(sym)
    }

    /// Reads `bits` raw bits, 1 to 32.
    pub fn read_bits(&mut self, bits: u32) -> io::Result<u32> {
        debug_assert!(bits >= 1 && bits <= 32);
        if bits > 19 {
            let lower = self.read_short()? as u32;
            let upper = self.read_bits(bits - 16)?;
            return Ok((upper << 16) | lower);
        }
        self.length >>= bits;
        let sym = self.value / self.length;
        self.value -= sym * self.length;
        if self.length < AC_MIN_LENGTH {
            self.renorm()?;
        }
        if sym >= (1 << bits) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "arithmetic decoder out of sync",
            ));
        }
        Ok(sym)
    }

    pub fn read_byte(&mut self) -> io::Result<u8> {
        self.length >>= 8;
        let sym = self.value / self.length;
        self.value -= sym * self.length;
        if self.length < AC_MIN_LENGTH {
            self.renorm()?;
        }
        if sym >= 256 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "arithmetic decoder out of sync",
            ));
        }
        Ok(sym as u8)
    }

    pub fn read_short(&mut self) -> io::Result<u16> {
        self.length >>= 16;
        let sym = self.value / self.length;
        self.value -= sym * self.length;
        if self.length < AC_MIN_LENGTH {
            self.renorm()?;
        }
        if sym >= 65536 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "arithmetic decoder out of sync",
            ));
        }
        Ok(sym as u16)
    }

    pub fn read_int(&mut self) -> io::Result<u32> {
        let lower = self.read_short()? as u32;
        let upper = self.read_short()? as u32;
        Ok((upper << 16) | lower)
    }

    pub fn read_int_64(&mut self) -> io::Result<u64> {
        let lower = self.read_int()? as u64;
        let upper = self.read_int()? as u64;
        Ok((upper << 32) | lower)
    }

    pub fn read_float(&mut self) -> io::Result<f32> {
        Ok(f32::from_bits(self.read_int()?))
    }

    pub fn read_double(&mut self) -> io::Result<f64> {
        Ok(f64::from_bits(self.read_int_64()?))
    }

    #[cfg(test)]
    pub(crate) fn length(&self) -> u32 {
        self.length
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> u32 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_seeds_window_from_first_four_bytes() {
        let mut decoder = ArithmeticDecoder::new(ByteSource::new(vec![0x12, 0x34, 0x56, 0x78]));
        decoder.read_init_bytes().unwrap();
        assert_eq!(decoder.value(), 0x1234_5678);
        assert_eq!(decoder.length(), AC_MAX_LENGTH);
    }

    #[test]
    fn raw_reads_keep_interval_wide_enough() {
        let bytes: Vec<u8> = (0..64).map(|i| (i * 37 + 11) as u8).collect();
        let mut decoder = ArithmeticDecoder::new(ByteSource::new(bytes));
        decoder.read_init_bytes().unwrap();
        for bits in [1u32, 3, 8, 13, 16, 19, 24, 32] {
            let sym = decoder.read_bits(bits).unwrap();
            if bits < 32 {
                assert!(sym < (1u32 << bits));
            }
            assert!(decoder.length() >= AC_MIN_LENGTH);
        }
    }

    #[test]
    fn model_decodes_keep_interval_wide_enough() {
        let bytes: Vec<u8> = (0..2048).map(|i| (i * 101 + 7) as u8).collect();
        let mut decoder = ArithmeticDecoder::new(ByteSource::new(bytes));
        decoder.read_init_bytes().unwrap();

        let mut bit_model = ArithmeticBitModel::new();
        let mut small = ArithmeticModel::new(8);
        let mut tabled = ArithmeticModel::new(128);
        for _ in 0..100 {
            let bit = decoder.decode_bit(&mut bit_model).unwrap();
            assert!(bit <= 1);
            assert!(decoder.length() >= AC_MIN_LENGTH);
            let sym = decoder.decode_symbol(&mut small).unwrap();
            assert!(sym < 8);
            assert!(decoder.length() >= AC_MIN_LENGTH);
            let sym = decoder.decode_symbol(&mut tabled).unwrap();
            assert!(sym < 128);
            assert!(decoder.length() >= AC_MIN_LENGTH);
        }
    }

    #[test]
    fn truncated_stream_is_an_eof() {
        let mut decoder = ArithmeticDecoder::new(ByteSource::new(vec![0x12, 0x34]));
        assert_eq!(
            decoder.read_init_bytes().unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
