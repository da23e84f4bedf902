//! Range encoder used only by tests.
//!
//! The decoder in this crate can only be checked against a stream some
//! encoder produced. This is the matching FastAC encoder, kept out of the
//! public surface since the crate is read only.

use super::decoder::AC_MIN_LENGTH;
use super::models::{ArithmeticBitModel, ArithmeticModel, BM_LENGTH_SHIFT, DM_LENGTH_SHIFT};

pub(crate) struct ArithmeticEncoder {
    out: Vec<u8>,
    base: u32,
    length: u32,
}

impl ArithmeticEncoder {
    pub fn new() -> Self {
        Self {
            out: Vec::new(),
            base: 0,
            length: u32::MAX,
        }
    }

    fn propagate_carry(&mut self) {
        let mut i = self.out.len();
        loop {
            assert!(i > 0, "carry with no bytes written");
            i -= 1;
            if self.out[i] == 0xFF {
                self.out[i] = 0;
            } else {
                self.out[i] += 1;
                break;
            }
        }
    }

    fn renorm(&mut self) {
        while self.length < AC_MIN_LENGTH {
            self.out.push((self.base >> 24) as u8);
            self.base <<= 8;
            self.length <<= 8;
        }
    }

    pub fn encode_bit(&mut self, model: &mut ArithmeticBitModel, bit: u32) {
        let x = model.bit_0_prob * (self.length >> BM_LENGTH_SHIFT);
        if bit == 0 {
            self.length = x;
            model.bit_0_count += 1;
        } else {
            let init_base = self.base;
            self.base = self.base.wrapping_add(x);
            self.length -= x;
            if init_base > self.base {
                self.propagate_carry();
            }
        }
        if self.length < AC_MIN_LENGTH {
            self.renorm();
        }
        model.bits_until_update -= 1;
        if model.bits_until_update == 0 {
            model.update();
        }
    }

    pub fn encode_symbol(&mut self, model: &mut ArithmeticModel, sym: u32) {
        let init_base = self.base;
        if sym == model.last_symbol {
            let x = model.distribution[sym as usize] * (self.length >> DM_LENGTH_SHIFT);
            self.base = self.base.wrapping_add(x);
            self.length -= x;
        } else {
            self.length >>= DM_LENGTH_SHIFT;
            let x = model.distribution[sym as usize] * self.length;
            self.base = self.base.wrapping_add(x);
            self.length = model.distribution[sym as usize + 1] * self.length - x;
        }
        if init_base > self.base {
            self.propagate_carry();
        }
        if self.length < AC_MIN_LENGTH {
            self.renorm();
        }
        model.symbol_count[sym as usize] += 1;
        model.symbols_until_update -= 1;
        if model.symbols_until_update == 0 {
            model.update();
        }
    }

    pub fn write_bits(&mut self, mut bits: u32, mut sym: u32) {
        if bits > 19 {
            self.write_short((sym & 0xFFFF) as u16);
            sym >>= 16;
            bits -= 16;
        }
        let init_base = self.base;
        self.length >>= bits;
        self.base = self.base.wrapping_add(sym * self.length);
        if init_base > self.base {
            self.propagate_carry();
        }
        if self.length < AC_MIN_LENGTH {
            self.renorm();
        }
    }

    pub fn write_short(&mut self, sym: u16) {
        let init_base = self.base;
        self.length >>= 16;
        self.base = self.base.wrapping_add(sym as u32 * self.length);
        if init_base > self.base {
            self.propagate_carry();
        }
        if self.length < AC_MIN_LENGTH {
            self.renorm();
        }
    }

    pub fn done(mut self) -> Vec<u8> {
        let init_base = self.base;
        if self.length > 2 * AC_MIN_LENGTH {
            self.base = self.base.wrapping_add(AC_MIN_LENGTH);
            self.length = AC_MIN_LENGTH >> 1;
        } else {
            self.base = self.base.wrapping_add(AC_MIN_LENGTH >> 1);
            self.length = AC_MIN_LENGTH >> 9;
        }
        if init_base > self.base {
            self.propagate_carry();
        }
        self.renorm();
        // padding so the decoder's renormalization never runs dry
        self.out.extend_from_slice(&[0, 0, 0, 0]);
        self.out
    }
}

/// Mirror of [super::decompressors::IntegerDecompressor].
pub(crate) struct IntegerCompressor {
    contexts: u32,
    bits_high: u32,
    corr_bits: u32,
    corr_range: u32,
    corr_min: i32,
    corr_max: i32,
    k: u32,
    m_bits: Vec<ArithmeticModel>,
    m_corrector0: ArithmeticBitModel,
    m_corrector: Vec<ArithmeticModel>,
}

impl IntegerCompressor {
    pub fn new(bits: u32, contexts: u32) -> Self {
        let bits_high = 8u32;
        let (corr_bits, corr_range, corr_min) = if bits != 0 && bits < 32 {
            (bits, 1u32 << bits, -((1u32 << bits) as i32 / 2))
        } else {
            (32, 0, i32::MIN)
        };
        let corr_max = if corr_range == 0 {
            i32::MAX
        } else {
            corr_min + (corr_range - 1) as i32
        };
        Self {
            contexts,
            bits_high,
            corr_bits,
            corr_range,
            corr_min,
            corr_max,
            k: 0,
            m_bits: (0..contexts)
                .map(|_| ArithmeticModel::new(corr_bits + 1))
                .collect(),
            m_corrector0: ArithmeticBitModel::new(),
            m_corrector: (1..=corr_bits)
                .map(|k| {
                    ArithmeticModel::new(if k <= bits_high { 1 << k } else { 1 << bits_high })
                })
                .collect(),
        }
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn compress(&mut self, enc: &mut ArithmeticEncoder, pred: i32, real: i32, context: u32) {
        assert!(context < self.contexts);
        let mut corr = real.wrapping_sub(pred);
        if corr < self.corr_min {
            corr = corr.wrapping_add(self.corr_range as i32);
        } else if corr > self.corr_max {
            corr = corr.wrapping_sub(self.corr_range as i32);
        }
        self.write_corrector(enc, corr, context);
    }

    fn write_corrector(&mut self, enc: &mut ArithmeticEncoder, mut c: i32, context: u32) {
        // find the tightest interval [-(2^k - 1), 2^k] containing the corrector
        let mut k = 0u32;
        let mut c1 = if c <= 0 { -(c as i64) } else { c as i64 - 1 } as u64;
        while c1 != 0 {
            c1 >>= 1;
            k += 1;
        }
        self.k = k;
        enc.encode_symbol(&mut self.m_bits[context as usize], k);
        if k == 0 {
            enc.encode_bit(&mut self.m_corrector0, c as u32);
            return;
        }
        if k >= 32 {
            return;
        }
        // translate the corrector into [0, 2^k)
        if c < 0 {
            c += (1 << k) - 1;
        } else {
            c -= 1;
        }
        if k <= self.bits_high {
            enc.encode_symbol(&mut self.m_corrector[k as usize - 1], c as u32);
        } else {
            let k1 = k - self.bits_high;
            let c1 = (c as u32) >> k1;
            enc.encode_symbol(&mut self.m_corrector[k as usize - 1], c1);
            enc.write_bits(k1, c as u32 & ((1 << k1) - 1));
        }
    }
}
