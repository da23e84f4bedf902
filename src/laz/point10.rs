//! Decompressor for LAS point format 0, the 20 byte record.

use super::decoder::ArithmeticDecoder;
use super::decompressors::{IntegerDecompressor, IntegerDecompressorBuilder};
use super::models::ArithmeticModel;
use super::utils::{u8_fold, StreamingMedian};
use std::io;

/// Size of a point format 0 record.
pub const POINT10_SIZE: usize = 20;

/// Serializes the possible return number / number of returns combinations
/// into one of 16 contexts.
const NUMBER_RETURN_MAP: [[u8; 8]; 8] = [
    [15, 14, 13, 12, 11, 10, 9, 8],
    [14, 0, 1, 3, 6, 10, 10, 9],
    [13, 1, 2, 4, 7, 11, 11, 10],
    [12, 3, 4, 5, 8, 12, 12, 11],
    [11, 6, 7, 8, 9, 13, 13, 12],
    [10, 10, 11, 12, 13, 14, 14, 13],
    [9, 10, 11, 12, 13, 14, 15, 14],
    [8, 9, 10, 11, 12, 13, 14, 15],
];

/// Distance of the return number from the pulse's last return.
const NUMBER_RETURN_LEVEL: [[u8; 8]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7],
    [1, 0, 1, 2, 3, 4, 5, 6],
    [2, 1, 0, 1, 2, 3, 4, 5],
    [3, 2, 1, 0, 1, 2, 3, 4],
    [4, 3, 2, 1, 0, 1, 2, 3],
    [5, 4, 3, 2, 1, 0, 1, 2],
    [6, 5, 4, 3, 2, 1, 0, 1],
    [7, 6, 5, 4, 3, 2, 1, 0],
];

/// One decoded format 0 record.
#[derive(Debug, Clone, Copy, Default)]
struct Point10 {
    x: i32,
    y: i32,
    z: i32,
    intensity: u16,
    /// return number, number of returns, scan direction and edge flag
    bit_byte: u8,
    classification: u8,
    scan_angle_rank: u8,
    user_data: u8,
    point_source_id: u16,
}

impl Point10 {
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            x: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            y: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            z: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            intensity: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            bit_byte: buf[14],
            classification: buf[15],
            scan_angle_rank: buf[16],
            user_data: buf[17],
            point_source_id: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
        }
    }

    fn to_bytes(self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
        out[12..14].copy_from_slice(&self.intensity.to_le_bytes());
        out[14] = self.bit_byte;
        out[15] = self.classification;
        out[16] = self.scan_angle_rank;
        out[17] = self.user_data;
        out[18..20].copy_from_slice(&self.point_source_id.to_le_bytes());
    }

    fn return_number(&self) -> usize {
        (self.bit_byte & 0x7) as usize
    }

    fn number_of_returns(&self) -> usize {
        ((self.bit_byte >> 3) & 0x7) as usize
    }

    fn scan_direction_flag(&self) -> usize {
        ((self.bit_byte >> 6) & 0x1) as usize
    }
}

fn new_model_slots(n: usize) -> Vec<Option<ArithmeticModel>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

fn model_for(slots: &mut [Option<ArithmeticModel>], index: usize) -> &mut ArithmeticModel {
    slots[index].get_or_insert_with(|| ArithmeticModel::new(256))
}

/// Decompresses format 0 records from a single arithmetic stream.
pub struct Point10Decompressor {
    last: Point10,
    have_last: bool,

    last_x_diff_median5: Vec<StreamingMedian>,
    last_y_diff_median5: Vec<StreamingMedian>,
    last_intensity: [u16; 16],
    last_height: [i32; 8],

    changed_values_model: ArithmeticModel,
    scan_angle_rank_models: [ArithmeticModel; 2],
    // models created on first use, keyed by the previous byte value
    bit_byte_models: Vec<Option<ArithmeticModel>>,
    classification_models: Vec<Option<ArithmeticModel>>,
    user_data_models: Vec<Option<ArithmeticModel>>,

    ic_intensity: IntegerDecompressor,
    ic_point_source_id: IntegerDecompressor,
    ic_dx: IntegerDecompressor,
    ic_dy: IntegerDecompressor,
    ic_z: IntegerDecompressor,
}

impl Default for Point10Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Point10Decompressor {
    pub fn new() -> Self {
        Self {
            last: Point10::default(),
            have_last: false,
            last_x_diff_median5: vec![StreamingMedian::new(); 16],
            last_y_diff_median5: vec![StreamingMedian::new(); 16],
            last_intensity: [0; 16],
            last_height: [0; 8],
            changed_values_model: ArithmeticModel::new(64),
            scan_angle_rank_models: [ArithmeticModel::new(256), ArithmeticModel::new(256)],
            bit_byte_models: new_model_slots(256),
            classification_models: new_model_slots(256),
            user_data_models: new_model_slots(256),
            ic_intensity: IntegerDecompressorBuilder::new()
                .bits(16)
                .contexts(4)
                .build_initialized(),
            ic_point_source_id: IntegerDecompressorBuilder::new().bits(16).build_initialized(),
            ic_dx: IntegerDecompressorBuilder::new()
                .bits(32)
                .contexts(2)
                .build_initialized(),
            ic_dy: IntegerDecompressorBuilder::new()
                .bits(32)
                .contexts(22)
                .build_initialized(),
            ic_z: IntegerDecompressorBuilder::new()
                .bits(32)
                .contexts(20)
                .build_initialized(),
        }
    }

    /// Reads the first record raw and emits it unchanged.
    pub fn decompress_first(
        &mut self,
        src: &mut super::source::ByteSource,
        out: &mut [u8],
    ) -> io::Result<()> {
        src.read_exact(&mut out[..POINT10_SIZE])?;
        self.last = Point10::from_bytes(out);
        // the intensity predictor starts at zero
        self.last.intensity = 0;
        self.have_last = true;
        Ok(())
    }

    /// Decodes the next record into `out`.
    pub fn decompress_with(
        &mut self,
        decoder: &mut ArithmeticDecoder,
        out: &mut [u8],
    ) -> io::Result<()> {
        debug_assert!(self.have_last);
        let changed_values = decoder.decode_symbol(&mut self.changed_values_model)?;

        let m;
        let l;
        if changed_values != 0 {
            // the bit byte must be decoded first, the scan direction flag
            // below may come from the fresh value
            if changed_values & 32 != 0 {
                let model = model_for(&mut self.bit_byte_models, self.last.bit_byte as usize);
                self.last.bit_byte = decoder.decode_symbol(model)? as u8;
            }

            let r = self.last.return_number();
            let n = self.last.number_of_returns();
            m = NUMBER_RETURN_MAP[n][r] as usize;
            l = NUMBER_RETURN_LEVEL[n][r] as usize;

            if changed_values & 16 != 0 {
                let context = if m < 3 { m as u32 } else { 3 };
                let intensity = self.ic_intensity.decompress(
                    decoder,
                    self.last_intensity[m] as i32,
                    context,
                )? as u16;
                self.last.intensity = intensity;
                self.last_intensity[m] = intensity;
            } else {
                self.last.intensity = self.last_intensity[m];
            }

            if changed_values & 8 != 0 {
                let model =
                    model_for(&mut self.classification_models, self.last.classification as usize);
                self.last.classification = decoder.decode_symbol(model)? as u8;
            }

            if changed_values & 4 != 0 {
                let model = &mut self.scan_angle_rank_models[self.last.scan_direction_flag()];
                let val = decoder.decode_symbol(model)? as i32;
                self.last.scan_angle_rank = u8_fold(val + self.last.scan_angle_rank as i32);
            }

            if changed_values & 2 != 0 {
                let model = model_for(&mut self.user_data_models, self.last.user_data as usize);
                self.last.user_data = decoder.decode_symbol(model)? as u8;
            }

            if changed_values & 1 != 0 {
                self.last.point_source_id = self.ic_point_source_id.decompress(
                    decoder,
                    self.last.point_source_id as i32,
                    0,
                )? as u16;
            }
        } else {
            let r = self.last.return_number();
            let n = self.last.number_of_returns();
            m = NUMBER_RETURN_MAP[n][r] as usize;
            l = NUMBER_RETURN_LEVEL[n][r] as usize;
        }

        let n = self.last.number_of_returns();

        // x
        let median = self.last_x_diff_median5[m].get();
        let diff = self
            .ic_dx
            .decompress(decoder, median, (n == 1) as u32)?;
        self.last.x = self.last.x.wrapping_add(diff);
        self.last_x_diff_median5[m].add(diff);

        // y, with the x corrector width as extra context
        let median = self.last_y_diff_median5[m].get();
        let k_bits = self.ic_dx.k();
        let context = (n == 1) as u32 + if k_bits < 20 { k_bits & !1 } else { 20 };
        let diff = self.ic_dy.decompress(decoder, median, context)?;
        self.last.y = self.last.y.wrapping_add(diff);
        self.last_y_diff_median5[m].add(diff);

        // z, predicted from the last height seen at this return level
        let k_bits = (self.ic_dx.k() + self.ic_dy.k()) / 2;
        let context = (n == 1) as u32 + if k_bits < 18 { k_bits & !1 } else { 18 };
        self.last.z = self
            .ic_z
            .decompress(decoder, self.last_height[l], context)?;
        self.last_height[l] = self.last.z;

        self.last.to_bytes(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::laz::source::ByteSource;

    #[test]
    fn return_tables_are_consistent() {
        for n in 0..8 {
            for r in 0..8 {
                assert_eq!(
                    NUMBER_RETURN_LEVEL[n][r] as i32,
                    (n as i32 - r as i32).abs()
                );
                assert_eq!(NUMBER_RETURN_MAP[n][r], NUMBER_RETURN_MAP[r][n]);
                assert!(NUMBER_RETURN_MAP[n][r] < 16);
            }
        }
    }

    #[test]
    fn first_point_passes_through_raw() {
        let record: Vec<u8> = (0..POINT10_SIZE as u8).collect();
        let mut src = ByteSource::new(record.clone());
        let mut decompressor = Point10Decompressor::new();
        let mut out = [0u8; POINT10_SIZE];
        decompressor.decompress_first(&mut src, &mut out).unwrap();
        assert_eq!(&out[..], &record[..]);
        // internal intensity predictor reset, output untouched
        assert_eq!(decompressor.last.intensity, 0);
        assert_eq!(&out[12..14], &record[12..14]);
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn bitfield_accessors() {
        let mut p = Point10::default();
        p.bit_byte = 0b0101_1010;
        assert_eq!(p.return_number(), 2);
        assert_eq!(p.number_of_returns(), 3);
        assert_eq!(p.scan_direction_flag(), 1);
    }

    #[test]
    fn record_roundtrips_through_bytes() {
        let p = Point10 {
            x: -123_456,
            y: 789_012,
            z: 345,
            intensity: 40_000,
            bit_byte: 0x5A,
            classification: 2,
            scan_angle_rank: 250,
            user_data: 17,
            point_source_id: 4097,
        };
        let mut buf = [0u8; POINT10_SIZE];
        p.to_bytes(&mut buf);
        let q = Point10::from_bytes(&buf);
        let mut buf2 = [0u8; POINT10_SIZE];
        q.to_bytes(&mut buf2);
        assert_eq!(buf, buf2);
    }
}
