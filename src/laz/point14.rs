//! Decompressor for LAS 1.4 point formats 6, 7 and 8.
//!
//! A layered chunk multiplexes the point fields into independent arithmetic
//! streams, one per field group, so a reader can skip fields it does not
//! need. All streams share the per scanner channel model sets; switching the
//! channel switches the whole prediction state.

use super::decoder::ArithmeticDecoder;
use super::decompressors::{IntegerDecompressor, IntegerDecompressorBuilder};
use super::models::ArithmeticModel;
use super::source::ByteSource;
use super::utils::{lower_byte, u8_clamp, u8_fold, upper_byte, StreamingMedian};
use log::trace;
use std::io;

/// Size of the format 6 base record.
pub const POINT14_SIZE: usize = 30;
/// Size of the RGB block of formats 7 and 8.
pub const RGB_SIZE: usize = 6;
/// Size of the NIR block of format 8.
pub const NIR_SIZE: usize = 2;

const GPS_TIME_MULTI: i32 = 500;
const GPS_TIME_MULTI_MINUS: i32 = -10;
const GPS_TIME_MULTI_UNCHANGED: i32 = GPS_TIME_MULTI - GPS_TIME_MULTI_MINUS + 1;
const GPS_TIME_MULTI_CODE_FULL: i32 = GPS_TIME_MULTI - GPS_TIME_MULTI_MINUS + 2;
const GPS_TIME_MULTI_TOTAL: i32 = GPS_TIME_MULTI - GPS_TIME_MULTI_MINUS + 6;

/// Maps return number and count combinations, including the malformed ones
/// real files contain, onto six prediction contexts.
const NUMBER_RETURN_MAP_6CTX: [[u8; 16]; 16] = [
    [0, 1, 2, 3, 4, 5, 3, 4, 4, 5, 5, 5, 5, 5, 5, 5],
    [1, 0, 1, 2, 3, 4, 4, 5, 5, 5, 5, 5, 5, 5, 5, 5],
    [2, 1, 0, 1, 2, 3, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5],
    [3, 2, 1, 0, 1, 2, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5],
    [4, 3, 2, 1, 0, 1, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5],
    [5, 4, 3, 2, 1, 0, 1, 5, 5, 5, 5, 5, 5, 5, 5, 5],
    [3, 4, 5, 5, 5, 1, 0, 1, 2, 3, 4, 5, 5, 5, 5, 5],
    [4, 5, 5, 5, 5, 5, 1, 0, 1, 2, 3, 4, 5, 5, 5, 5],
    [4, 5, 5, 5, 5, 5, 2, 1, 0, 1, 2, 3, 4, 5, 5, 5],
    [5, 5, 5, 5, 5, 5, 3, 2, 1, 0, 1, 2, 3, 4, 5, 5],
    [5, 5, 5, 5, 5, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5],
    [5, 5, 5, 5, 5, 5, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4],
    [5, 5, 5, 5, 5, 5, 5, 5, 4, 3, 2, 1, 0, 1, 2, 3],
    [5, 5, 5, 5, 5, 5, 5, 5, 5, 4, 3, 2, 1, 0, 1, 2],
    [5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 4, 3, 2, 1, 0, 1],
    [5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 4, 3, 2, 1, 0],
];

/// Distance of the return from the last return of its pulse, capped at 7.
const NUMBER_RETURN_LEVEL_8CTX: [[u8; 16]; 16] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7, 7, 7],
    [1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7, 7],
    [2, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7, 7],
    [3, 2, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7, 7],
    [4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7],
    [5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7, 7],
    [6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7, 7],
    [7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6, 7, 7],
    [7, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6, 7],
    [7, 7, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5, 6],
    [7, 7, 7, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4, 5],
    [7, 7, 7, 7, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3, 4],
    [7, 7, 7, 7, 7, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2, 3],
    [7, 7, 7, 7, 7, 7, 7, 6, 5, 4, 3, 2, 1, 0, 1, 2],
    [7, 7, 7, 7, 7, 7, 7, 7, 6, 5, 4, 3, 2, 1, 0, 1],
    [7, 7, 7, 7, 7, 7, 7, 7, 7, 6, 5, 4, 3, 2, 1, 0],
];

/// A decoded format 6 base record.
#[derive(Debug, Clone, Copy, Default)]
struct Point14 {
    x: i32,
    y: i32,
    z: i32,
    intensity: u16,
    return_number: u8,
    number_of_returns: u8,
    class_flags: u8,
    scanner_channel: u8,
    scan_direction_flag: bool,
    edge_of_flight_line: bool,
    classification: u8,
    user_data: u8,
    scan_angle: i16,
    point_source_id: u16,
    gps_time: f64,
}

impl Point14 {
    fn from_bytes(buf: &[u8]) -> Self {
        let returns = buf[14];
        let flags = buf[15];
        Self {
            x: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            y: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            z: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            intensity: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            return_number: returns & 0x0F,
            number_of_returns: (returns >> 4) & 0x0F,
            class_flags: flags & 0x0F,
            scanner_channel: (flags >> 4) & 0x03,
            scan_direction_flag: flags & 0x40 != 0,
            edge_of_flight_line: flags & 0x80 != 0,
            classification: buf[16],
            user_data: buf[17],
            scan_angle: i16::from_le_bytes(buf[18..20].try_into().unwrap()),
            point_source_id: u16::from_le_bytes(buf[20..22].try_into().unwrap()),
            gps_time: f64::from_le_bytes(buf[22..30].try_into().unwrap()),
        }
    }

    fn to_bytes(self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.z.to_le_bytes());
        out[12..14].copy_from_slice(&self.intensity.to_le_bytes());
        out[14] = (self.return_number & 0x0F) | (self.number_of_returns << 4);
        out[15] = (self.class_flags & 0x0F)
            | (self.scanner_channel << 4)
            | ((self.scan_direction_flag as u8) << 6)
            | ((self.edge_of_flight_line as u8) << 7);
        out[16] = self.classification;
        out[17] = self.user_data;
        out[18..20].copy_from_slice(&self.scan_angle.to_le_bytes());
        out[20..22].copy_from_slice(&self.point_source_id.to_le_bytes());
        out[22..30].copy_from_slice(&self.gps_time.to_le_bytes());
    }
}

fn model_slots(n: usize) -> Vec<Option<ArithmeticModel>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

/// Prediction state of one scanner channel.
struct ChannelContext {
    unused: bool,
    last: Point14,
    gps_time_change: bool,

    last_intensity: [u16; 8],
    last_z: [i32; 8],
    last_x_diff_median5: Vec<StreamingMedian>,
    last_y_diff_median5: Vec<StreamingMedian>,
    last_gps_time: [i64; 4],
    last_gps_time_diff: [i32; 4],
    multi_extreme_counter: [i32; 4],
    gps_last: usize,
    gps_next: usize,

    changed_values_models: Vec<ArithmeticModel>,
    scanner_channel_model: ArithmeticModel,
    number_of_returns_models: Vec<Option<ArithmeticModel>>,
    return_number_models: Vec<Option<ArithmeticModel>>,
    return_number_gps_same_model: ArithmeticModel,
    classification_models: Vec<Option<ArithmeticModel>>,
    flags_models: Vec<Option<ArithmeticModel>>,
    user_data_models: Vec<Option<ArithmeticModel>>,
    gps_time_multi_model: ArithmeticModel,
    gps_time_0diff_model: ArithmeticModel,

    ic_dx: IntegerDecompressor,
    ic_dy: IntegerDecompressor,
    ic_z: IntegerDecompressor,
    ic_intensity: IntegerDecompressor,
    ic_scan_angle: IntegerDecompressor,
    ic_point_source_id: IntegerDecompressor,
    ic_gps_time: IntegerDecompressor,
}

impl ChannelContext {
    fn new() -> Self {
        Self {
            unused: true,
            last: Point14::default(),
            gps_time_change: false,
            last_intensity: [0; 8],
            last_z: [0; 8],
            last_x_diff_median5: vec![StreamingMedian::new(); 12],
            last_y_diff_median5: vec![StreamingMedian::new(); 12],
            last_gps_time: [0; 4],
            last_gps_time_diff: [0; 4],
            multi_extreme_counter: [0; 4],
            gps_last: 0,
            gps_next: 0,
            changed_values_models: (0..8).map(|_| ArithmeticModel::new(128)).collect(),
            scanner_channel_model: ArithmeticModel::new(3),
            number_of_returns_models: model_slots(16),
            return_number_models: model_slots(16),
            return_number_gps_same_model: ArithmeticModel::new(13),
            classification_models: model_slots(64),
            flags_models: model_slots(64),
            user_data_models: model_slots(64),
            gps_time_multi_model: ArithmeticModel::new(GPS_TIME_MULTI_TOTAL as u32),
            gps_time_0diff_model: ArithmeticModel::new(5),
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
            ic_intensity: IntegerDecompressorBuilder::new()
                .bits(16)
                .contexts(4)
                .build_initialized(),
            ic_scan_angle: IntegerDecompressorBuilder::new()
                .bits(16)
                .contexts(2)
                .build_initialized(),
            ic_point_source_id: IntegerDecompressorBuilder::new().bits(16).build_initialized(),
            ic_gps_time: IntegerDecompressorBuilder::new()
                .bits(32)
                .contexts(9)
                .build_initialized(),
        }
    }

    /// Activates the channel, seeding every predictor from `last`.
    fn init_from(&mut self, last: &Point14) {
        self.last = *last;
        self.gps_time_change = false;
        self.last_intensity = [last.intensity; 8];
        self.last_z = [last.z; 8];
        self.last_gps_time = [0; 4];
        self.last_gps_time[0] = last.gps_time.to_bits() as i64;
        self.last_gps_time_diff = [0; 4];
        self.multi_extreme_counter = [0; 4];
        self.gps_last = 0;
        self.gps_next = 0;
        self.unused = false;
    }
}

/// RGB prediction state of one scanner channel.
struct RgbContext {
    unused: bool,
    last: [u16; 3],
    byte_used_model: ArithmeticModel,
    diff_models: Vec<ArithmeticModel>,
}

impl RgbContext {
    fn new() -> Self {
        Self {
            unused: true,
            last: [0; 3],
            byte_used_model: ArithmeticModel::new(128),
            diff_models: (0..6).map(|_| ArithmeticModel::new(256)).collect(),
        }
    }

    fn init_from(&mut self, last: [u16; 3]) {
        self.last = last;
        self.unused = false;
    }
}

/// NIR prediction state of one scanner channel.
struct NirContext {
    unused: bool,
    last: u16,
    byte_used_model: ArithmeticModel,
    diff_models: [ArithmeticModel; 2],
}

impl NirContext {
    fn new() -> Self {
        Self {
            unused: true,
            last: 0,
            byte_used_model: ArithmeticModel::new(4),
            diff_models: [ArithmeticModel::new(256), ArithmeticModel::new(256)],
        }
    }

    fn init_from(&mut self, last: u16) {
        self.last = last;
        self.unused = false;
    }
}

fn stream_decoder(source: &mut ByteSource, size: u32) -> io::Result<Option<ArithmeticDecoder>> {
    if size == 0 {
        return Ok(None);
    }
    let mut decoder = ArithmeticDecoder::new(source.take(size as usize)?);
    decoder.read_init_bytes()?;
    Ok(Some(decoder))
}

/// Decompresses format 6/7/8 records from a layered chunk.
pub struct Point14Decompressor {
    has_rgb: bool,
    has_nir: bool,
    num_extra_bytes: usize,

    contexts: Vec<ChannelContext>,
    rgb_contexts: Vec<RgbContext>,
    nir_contexts: Vec<NirContext>,
    current_context: usize,
    rgb_context: usize,
    nir_context: usize,

    first_record: Vec<u8>,

    dec_channel_returns_xy: Option<ArithmeticDecoder>,
    dec_z: Option<ArithmeticDecoder>,
    dec_classification: Option<ArithmeticDecoder>,
    dec_flags: Option<ArithmeticDecoder>,
    dec_intensity: Option<ArithmeticDecoder>,
    dec_scan_angle: Option<ArithmeticDecoder>,
    dec_user_data: Option<ArithmeticDecoder>,
    dec_point_source: Option<ArithmeticDecoder>,
    dec_gps_time: Option<ArithmeticDecoder>,
    dec_rgb: Option<ArithmeticDecoder>,
    dec_nir: Option<ArithmeticDecoder>,
}

impl Point14Decompressor {
    /// Size in bytes of the records this decompressor emits.
    pub fn record_size(&self) -> usize {
        POINT14_SIZE
            + if self.has_rgb { RGB_SIZE } else { 0 }
            + if self.has_nir { NIR_SIZE } else { 0 }
            + self.num_extra_bytes
    }

    /// Parses the chunk preamble: the raw first record, the chunk point
    /// count and the sizes and bytes of every layer.
    pub fn new(
        bytes: Vec<u8>,
        has_rgb: bool,
        has_nir: bool,
        num_extra_bytes: usize,
    ) -> io::Result<Self> {
        let mut source = ByteSource::new(bytes);

        let record_size = POINT14_SIZE
            + if has_rgb { RGB_SIZE } else { 0 }
            + if has_nir { NIR_SIZE } else { 0 }
            + num_extra_bytes;
        let mut first_record = vec![0u8; record_size];
        source.read_exact(&mut first_record)?;

        let point_count = source.read_u32_le()?;
        trace!("layered chunk announces {point_count} points");

        let size_xy = source.read_u32_le()?;
        let size_z = source.read_u32_le()?;
        let size_classification = source.read_u32_le()?;
        let size_flags = source.read_u32_le()?;
        let size_intensity = source.read_u32_le()?;
        let size_scan_angle = source.read_u32_le()?;
        let size_user_data = source.read_u32_le()?;
        let size_point_source = source.read_u32_le()?;
        let size_gps_time = source.read_u32_le()?;
        let size_rgb = if has_rgb { source.read_u32_le()? } else { 0 };
        let size_nir = if has_nir { source.read_u32_le()? } else { 0 };
        let mut sizes_extra = Vec::with_capacity(num_extra_bytes);
        for _ in 0..num_extra_bytes {
            sizes_extra.push(source.read_u32_le()?);
        }

        let dec_channel_returns_xy = stream_decoder(&mut source, size_xy)?;
        let dec_z = stream_decoder(&mut source, size_z)?;
        let dec_classification = stream_decoder(&mut source, size_classification)?;
        let dec_flags = stream_decoder(&mut source, size_flags)?;
        let dec_intensity = stream_decoder(&mut source, size_intensity)?;
        let dec_scan_angle = stream_decoder(&mut source, size_scan_angle)?;
        let dec_user_data = stream_decoder(&mut source, size_user_data)?;
        let dec_point_source = stream_decoder(&mut source, size_point_source)?;
        let dec_gps_time = stream_decoder(&mut source, size_gps_time)?;
        let dec_rgb = stream_decoder(&mut source, size_rgb)?;
        let dec_nir = stream_decoder(&mut source, size_nir)?;
        for size in sizes_extra {
            // the extra byte layers only need to be consumed
            source.take(size as usize)?;
        }

        let first_point = Point14::from_bytes(&first_record);
        let channel = first_point.scanner_channel as usize;

        let mut decompressor = Self {
            has_rgb,
            has_nir,
            num_extra_bytes,
            contexts: (0..4).map(|_| ChannelContext::new()).collect(),
            rgb_contexts: (0..4).map(|_| RgbContext::new()).collect(),
            nir_contexts: (0..4).map(|_| NirContext::new()).collect(),
            current_context: channel,
            rgb_context: channel,
            nir_context: channel,
            first_record,
            dec_channel_returns_xy,
            dec_z,
            dec_classification,
            dec_flags,
            dec_intensity,
            dec_scan_angle,
            dec_user_data,
            dec_point_source,
            dec_gps_time,
            dec_rgb,
            dec_nir,
        };

        decompressor.contexts[channel].init_from(&first_point);
        if has_rgb {
            let rgb = [
                u16::from_le_bytes(
                    decompressor.first_record[POINT14_SIZE..POINT14_SIZE + 2]
                        .try_into()
                        .unwrap(),
                ),
                u16::from_le_bytes(
                    decompressor.first_record[POINT14_SIZE + 2..POINT14_SIZE + 4]
                        .try_into()
                        .unwrap(),
                ),
                u16::from_le_bytes(
                    decompressor.first_record[POINT14_SIZE + 4..POINT14_SIZE + 6]
                        .try_into()
                        .unwrap(),
                ),
            ];
            decompressor.rgb_contexts[channel].init_from(rgb);
        }
        if has_nir {
            let offset = POINT14_SIZE + RGB_SIZE;
            let nir = u16::from_le_bytes(
                decompressor.first_record[offset..offset + 2].try_into().unwrap(),
            );
            decompressor.nir_contexts[channel].init_from(nir);
        }
        Ok(decompressor)
    }

    /// Emits the raw first record.
    pub fn first_point(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.first_record);
    }

    /// Decodes the next record into `out`.
    pub fn decompress_next(&mut self, out: &mut [u8]) -> io::Result<()> {
        let dec_xy = self.dec_channel_returns_xy.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "chunk has no channel/returns/XY layer",
            )
        })?;

        // context from the previous point of the current channel: single,
        // first, last or intermediate return, and whether its time changed
        let lpr = {
            let ctx = &self.contexts[self.current_context];
            (ctx.last.return_number == 1) as usize
                + if ctx.last.return_number >= ctx.last.number_of_returns {
                    2
                } else {
                    0
                }
                + if ctx.gps_time_change { 4 } else { 0 }
        };

        let changed_values = {
            let ctx = &mut self.contexts[self.current_context];
            dec_xy.decode_symbol(&mut ctx.changed_values_models[lpr])?
        };

        if changed_values & (1 << 6) != 0 {
            let diff = {
                let ctx = &mut self.contexts[self.current_context];
                dec_xy.decode_symbol(&mut ctx.scanner_channel_model)?
            };
            let channel = (self.current_context + diff as usize + 1) % 4;
            if self.contexts[channel].unused {
                let last = self.contexts[self.current_context].last;
                self.contexts[channel].init_from(&last);
            }
            self.current_context = channel;
            self.contexts[channel].last.scanner_channel = channel as u8;
        }

        let point_source_change = changed_values & (1 << 5) != 0;
        let gps_time_change = changed_values & (1 << 4) != 0;
        let scan_angle_change = changed_values & (1 << 3) != 0;

        let ctx = &mut self.contexts[self.current_context];
        let last_n = ctx.last.number_of_returns as usize;
        let last_r = ctx.last.return_number as usize;

        let n = if changed_values & (1 << 2) != 0 {
            let model = ctx.number_of_returns_models[last_n]
                .get_or_insert_with(|| ArithmeticModel::new(16));
            let n = dec_xy.decode_symbol(model)? as usize;
            ctx.last.number_of_returns = n as u8;
            n
        } else {
            last_n
        };

        let r = match changed_values & 3 {
            0 => last_r,
            1 => {
                let r = (last_r + 1) % 16;
                ctx.last.return_number = r as u8;
                r
            }
            2 => {
                let r = (last_r + 15) % 16;
                ctx.last.return_number = r as u8;
                r
            }
            _ => {
                let r = if gps_time_change {
                    let model = ctx.return_number_models[last_r]
                        .get_or_insert_with(|| ArithmeticModel::new(16));
                    dec_xy.decode_symbol(model)? as usize
                } else {
                    let sym =
                        dec_xy.decode_symbol(&mut ctx.return_number_gps_same_model)? as usize;
                    (last_r + sym + 2) % 16
                };
                ctx.last.return_number = r as u8;
                r
            }
        };

        let m = NUMBER_RETURN_MAP_6CTX[n][r] as usize;
        let l = NUMBER_RETURN_LEVEL_8CTX[n][r] as usize;
        let median_index = (m << 1) | gps_time_change as usize;

        // x
        let median = ctx.last_x_diff_median5[median_index].get();
        let diff = ctx.ic_dx.decompress(dec_xy, median, (n == 1) as u32)?;
        ctx.last.x = ctx.last.x.wrapping_add(diff);
        ctx.last_x_diff_median5[median_index].add(diff);

        // y
        let median = ctx.last_y_diff_median5[median_index].get();
        let k_bits = ctx.ic_dx.k();
        let context = (n == 1) as u32 + if k_bits < 20 { k_bits & !1 } else { 20 };
        let diff = ctx.ic_dy.decompress(dec_xy, median, context)?;
        ctx.last.y = ctx.last.y.wrapping_add(diff);
        ctx.last_y_diff_median5[median_index].add(diff);

        // z
        if let Some(dec) = self.dec_z.as_mut() {
            let k_bits = (ctx.ic_dx.k() + ctx.ic_dy.k()) / 2;
            let context = (n == 1) as u32 + if k_bits < 18 { k_bits & !1 } else { 18 };
            let z = ctx.ic_z.decompress(dec, ctx.last_z[l], context)?;
            ctx.last.z = z;
            ctx.last_z[l] = z;
        }

        // classification
        if let Some(dec) = self.dec_classification.as_mut() {
            let index = ((ctx.last.classification as usize & 0x1F) << 1)
                + (r == 1 && r >= n) as usize;
            let model =
                ctx.classification_models[index].get_or_insert_with(|| ArithmeticModel::new(256));
            ctx.last.classification = dec.decode_symbol(model)? as u8;
        }

        // classification flags, scan direction and edge of flight line
        if let Some(dec) = self.dec_flags.as_mut() {
            let index = ((ctx.last.edge_of_flight_line as usize) << 5)
                | ((ctx.last.scan_direction_flag as usize) << 4)
                | ctx.last.class_flags as usize;
            let model = ctx.flags_models[index].get_or_insert_with(|| ArithmeticModel::new(64));
            let flags = dec.decode_symbol(model)?;
            ctx.last.edge_of_flight_line = flags & (1 << 5) != 0;
            ctx.last.scan_direction_flag = flags & (1 << 4) != 0;
            ctx.last.class_flags = (flags & 0x0F) as u8;
        }

        // intensity
        if let Some(dec) = self.dec_intensity.as_mut() {
            let index = gps_time_change as usize
                | (((r >= n) as usize) << 1)
                | (((r == 1) as usize) << 2);
            let intensity = ctx.ic_intensity.decompress(
                dec,
                ctx.last_intensity[index] as i32,
                (index >> 1) as u32,
            )? as u16;
            ctx.last_intensity[index] = intensity;
            ctx.last.intensity = intensity;
        }

        // scan angle
        if scan_angle_change {
            if let Some(dec) = self.dec_scan_angle.as_mut() {
                let angle = ctx.ic_scan_angle.decompress(
                    dec,
                    ctx.last.scan_angle as i32,
                    gps_time_change as u32,
                )?;
                ctx.last.scan_angle = angle as u16 as i16;
            }
        }

        // user data
        if let Some(dec) = self.dec_user_data.as_mut() {
            let model = ctx.user_data_models[ctx.last.user_data as usize / 4]
                .get_or_insert_with(|| ArithmeticModel::new(256));
            ctx.last.user_data = dec.decode_symbol(model)? as u8;
        }

        // point source id
        if point_source_change {
            if let Some(dec) = self.dec_point_source.as_mut() {
                ctx.last.point_source_id = ctx.ic_point_source_id.decompress(
                    dec,
                    ctx.last.point_source_id as i32,
                    0,
                )? as u16;
            }
        }

        // gps time
        if gps_time_change {
            if let Some(dec) = self.dec_gps_time.as_mut() {
                Self::read_gps_time(ctx, dec)?;
                ctx.last.gps_time = f64::from_bits(ctx.last_gps_time[ctx.gps_last] as u64);
            }
        }
        ctx.gps_time_change = gps_time_change;

        ctx.last.to_bytes(&mut out[..POINT14_SIZE]);
        let mut offset = POINT14_SIZE;

        if self.has_rgb {
            if let Some(dec) = self.dec_rgb.as_mut() {
                if self.rgb_context != self.current_context {
                    let last = self.rgb_contexts[self.rgb_context].last;
                    self.rgb_context = self.current_context;
                    if self.rgb_contexts[self.rgb_context].unused {
                        self.rgb_contexts[self.rgb_context].init_from(last);
                    }
                }
                self.rgb_contexts[self.rgb_context].decompress(dec)?;
            }
            let rgb = self.rgb_contexts[self.rgb_context].last;
            out[offset..offset + 2].copy_from_slice(&rgb[0].to_le_bytes());
            out[offset + 2..offset + 4].copy_from_slice(&rgb[1].to_le_bytes());
            out[offset + 4..offset + 6].copy_from_slice(&rgb[2].to_le_bytes());
            offset += RGB_SIZE;
        }

        if self.has_nir {
            if let Some(dec) = self.dec_nir.as_mut() {
                if self.nir_context != self.current_context {
                    let last = self.nir_contexts[self.nir_context].last;
                    self.nir_context = self.current_context;
                    if self.nir_contexts[self.nir_context].unused {
                        self.nir_contexts[self.nir_context].init_from(last);
                    }
                }
                self.nir_contexts[self.nir_context].decompress(dec)?;
            }
            let nir = self.nir_contexts[self.nir_context].last;
            out[offset..offset + 2].copy_from_slice(&nir.to_le_bytes());
            offset += NIR_SIZE;
        }

        // extra bytes are not decompressed
        out[offset..].fill(0);
        Ok(())
    }

    fn read_gps_time(ctx: &mut ChannelContext, dec: &mut ArithmeticDecoder) -> io::Result<()> {
        loop {
            if ctx.last_gps_time_diff[ctx.gps_last] == 0 {
                // the last integer difference was zero
                let multi = dec.decode_symbol(&mut ctx.gps_time_0diff_model)? as i32;
                match multi {
                    0 => break,
                    1 => {
                        // the difference fits in 32 bits
                        let diff = ctx.ic_gps_time.decompress(dec, 0, 0)?;
                        ctx.last_gps_time_diff[ctx.gps_last] = diff;
                        ctx.last_gps_time[ctx.gps_last] =
                            ctx.last_gps_time[ctx.gps_last].wrapping_add(diff as i64);
                        ctx.multi_extreme_counter[ctx.gps_last] = 0;
                        break;
                    }
                    2 => {
                        Self::read_full_gps_time(ctx, dec)?;
                        break;
                    }
                    _ => {
                        // switch to another time sequence
                        ctx.gps_last = (ctx.gps_last + multi as usize - 2) & 3;
                    }
                }
            } else {
                let multi = dec.decode_symbol(&mut ctx.gps_time_multi_model)? as i32;
                if multi == 1 {
                    let pred = ctx.last_gps_time_diff[ctx.gps_last];
                    let diff = ctx.ic_gps_time.decompress(dec, pred, 1)?;
                    ctx.last_gps_time[ctx.gps_last] =
                        ctx.last_gps_time[ctx.gps_last].wrapping_add(diff as i64);
                    ctx.multi_extreme_counter[ctx.gps_last] = 0;
                    break;
                } else if multi < GPS_TIME_MULTI_UNCHANGED {
                    let gps_time_diff: i32;
                    if multi == 0 {
                        gps_time_diff = ctx.ic_gps_time.decompress(dec, 0, 7)?;
                        ctx.multi_extreme_counter[ctx.gps_last] += 1;
                        if ctx.multi_extreme_counter[ctx.gps_last] > 3 {
                            ctx.last_gps_time_diff[ctx.gps_last] = gps_time_diff;
                            ctx.multi_extreme_counter[ctx.gps_last] = 0;
                        }
                    } else if multi < GPS_TIME_MULTI {
                        let pred = multi.wrapping_mul(ctx.last_gps_time_diff[ctx.gps_last]);
                        gps_time_diff = if multi < 10 {
                            ctx.ic_gps_time.decompress(dec, pred, 2)?
                        } else {
                            ctx.ic_gps_time.decompress(dec, pred, 3)?
                        };
                    } else if multi == GPS_TIME_MULTI {
                        let pred =
                            GPS_TIME_MULTI.wrapping_mul(ctx.last_gps_time_diff[ctx.gps_last]);
                        gps_time_diff = ctx.ic_gps_time.decompress(dec, pred, 4)?;
                        ctx.multi_extreme_counter[ctx.gps_last] += 1;
                        if ctx.multi_extreme_counter[ctx.gps_last] > 3 {
                            ctx.last_gps_time_diff[ctx.gps_last] = gps_time_diff;
                            ctx.multi_extreme_counter[ctx.gps_last] = 0;
                        }
                    } else {
                        let multi = GPS_TIME_MULTI - multi;
                        if multi > GPS_TIME_MULTI_MINUS {
                            let pred = multi.wrapping_mul(ctx.last_gps_time_diff[ctx.gps_last]);
                            gps_time_diff = ctx.ic_gps_time.decompress(dec, pred, 5)?;
                        } else {
                            let pred = GPS_TIME_MULTI_MINUS
                                .wrapping_mul(ctx.last_gps_time_diff[ctx.gps_last]);
                            gps_time_diff = ctx.ic_gps_time.decompress(dec, pred, 6)?;
                            ctx.multi_extreme_counter[ctx.gps_last] += 1;
                            if ctx.multi_extreme_counter[ctx.gps_last] > 3 {
                                ctx.last_gps_time_diff[ctx.gps_last] = gps_time_diff;
                                ctx.multi_extreme_counter[ctx.gps_last] = 0;
                            }
                        }
                    }
                    ctx.last_gps_time[ctx.gps_last] =
                        ctx.last_gps_time[ctx.gps_last].wrapping_add(gps_time_diff as i64);
                    break;
                } else if multi == GPS_TIME_MULTI_CODE_FULL {
                    Self::read_full_gps_time(ctx, dec)?;
                    break;
                } else {
                    // switch to another time sequence
                    ctx.gps_last =
                        (ctx.gps_last + (multi - GPS_TIME_MULTI_CODE_FULL) as usize) & 3;
                }
            }
        }
        Ok(())
    }

    /// A full 64 bit time stamp starts a fresh slot in the history.
    fn read_full_gps_time(ctx: &mut ChannelContext, dec: &mut ArithmeticDecoder) -> io::Result<()> {
        ctx.gps_next = (ctx.gps_next + 1) & 3;
        let pred = (ctx.last_gps_time[ctx.gps_last] >> 32) as i32;
        let high = ctx.ic_gps_time.decompress(dec, pred, 8)?;
        let mut value = (high as u32 as u64) << 32;
        value |= dec.read_int()? as u64;
        ctx.last_gps_time[ctx.gps_next] = value as i64;
        ctx.gps_last = ctx.gps_next;
        ctx.last_gps_time_diff[ctx.gps_last] = 0;
        ctx.multi_extreme_counter[ctx.gps_last] = 0;
        Ok(())
    }

}

impl RgbContext {
    fn decompress(&mut self, dec: &mut ArithmeticDecoder) -> io::Result<()> {
        let sym = dec.decode_symbol(&mut self.byte_used_model)?;
        let last = self.last;
        let mut rgb = [0u16; 3];

        if sym & (1 << 0) != 0 {
            let corr = dec.decode_symbol(&mut self.diff_models[0])? as i32;
            rgb[0] = u8_fold(corr + lower_byte(last[0])) as u16;
        } else {
            rgb[0] = last[0] & 0x00FF;
        }
        if sym & (1 << 1) != 0 {
            let corr = dec.decode_symbol(&mut self.diff_models[1])? as i32;
            rgb[0] |= (u8_fold(corr + upper_byte(last[0])) as u16) << 8;
        } else {
            rgb[0] |= last[0] & 0xFF00;
        }
        if sym & (1 << 6) != 0 {
            // green and blue are corrected by the red deltas
            let mut diff = lower_byte(rgb[0]) - lower_byte(last[0]);
            if sym & (1 << 2) != 0 {
                let corr = dec.decode_symbol(&mut self.diff_models[2])? as i32;
                rgb[1] = u8_fold(corr + u8_clamp(diff + lower_byte(last[1])) as i32) as u16;
            } else {
                rgb[1] = last[1] & 0x00FF;
            }
            if sym & (1 << 4) != 0 {
                let corr = dec.decode_symbol(&mut self.diff_models[4])? as i32;
                diff = (diff + (lower_byte(rgb[1]) - lower_byte(last[1]))) / 2;
                rgb[2] = u8_fold(corr + u8_clamp(diff + lower_byte(last[2])) as i32) as u16;
            } else {
                rgb[2] = last[2] & 0x00FF;
            }
            let mut diff = upper_byte(rgb[0]) - upper_byte(last[0]);
            if sym & (1 << 3) != 0 {
                let corr = dec.decode_symbol(&mut self.diff_models[3])? as i32;
                rgb[1] |= (u8_fold(corr + u8_clamp(diff + upper_byte(last[1])) as i32) as u16) << 8;
            } else {
                rgb[1] |= last[1] & 0xFF00;
            }
            if sym & (1 << 5) != 0 {
                let corr = dec.decode_symbol(&mut self.diff_models[5])? as i32;
                diff = (diff + (upper_byte(rgb[1]) - upper_byte(last[1]))) / 2;
                rgb[2] |= (u8_fold(corr + u8_clamp(diff + upper_byte(last[2])) as i32) as u16) << 8;
            } else {
                rgb[2] |= last[2] & 0xFF00;
            }
        } else {
            rgb[1] = rgb[0];
            rgb[2] = rgb[0];
        }
        self.last = rgb;
        Ok(())
    }
}

impl NirContext {
    fn decompress(&mut self, dec: &mut ArithmeticDecoder) -> io::Result<()> {
        let sym = dec.decode_symbol(&mut self.byte_used_model)?;
        let last = self.last;
        let mut nir: u16;

        if sym & (1 << 0) != 0 {
            let corr = dec.decode_symbol(&mut self.diff_models[0])? as i32;
            nir = u8_fold(corr + lower_byte(last)) as u16;
        } else {
            nir = last & 0x00FF;
        }
        if sym & (1 << 1) != 0 {
            let corr = dec.decode_symbol(&mut self.diff_models[1])? as i32;
            nir |= (u8_fold(corr + upper_byte(last)) as u16) << 8;
        } else {
            nir |= last & 0xFF00;
        }
        self.last = nir;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_tables_are_consistent() {
        for n in 0..16i32 {
            for r in 0..16i32 {
                let level = NUMBER_RETURN_LEVEL_8CTX[n as usize][r as usize];
                assert_eq!(level as i32, (n - r).abs().min(7));
                assert!(NUMBER_RETURN_MAP_6CTX[n as usize][r as usize] <= 5);
                assert_eq!(
                    NUMBER_RETURN_MAP_6CTX[n as usize][r as usize],
                    NUMBER_RETURN_MAP_6CTX[r as usize][n as usize]
                );
            }
            assert_eq!(NUMBER_RETURN_MAP_6CTX[n as usize][n as usize], 0);
        }
    }

    #[test]
    fn gps_time_symbol_space() {
        assert_eq!(GPS_TIME_MULTI_UNCHANGED, 511);
        assert_eq!(GPS_TIME_MULTI_CODE_FULL, 512);
        assert_eq!(GPS_TIME_MULTI_TOTAL, 516);
    }

    #[test]
    fn record_roundtrips_through_bytes() {
        let p = Point14 {
            x: -1,
            y: 123_456,
            z: -789,
            intensity: 55_555,
            return_number: 3,
            number_of_returns: 5,
            class_flags: 0b1010,
            scanner_channel: 2,
            scan_direction_flag: true,
            edge_of_flight_line: false,
            classification: 6,
            user_data: 99,
            scan_angle: -7_500,
            point_source_id: 1_234,
            gps_time: 123_456.789,
        };
        let mut buf = [0u8; POINT14_SIZE];
        p.to_bytes(&mut buf);
        assert_eq!(buf[14], 3 | (5 << 4));
        assert_eq!(buf[15], 0b1010 | (2 << 4) | (1 << 6));
        let q = Point14::from_bytes(&buf);
        let mut buf2 = [0u8; POINT14_SIZE];
        q.to_bytes(&mut buf2);
        assert_eq!(buf, buf2);
    }

    #[test]
    fn first_point_and_layer_sizes_are_parsed() {
        // one format 7 point: 36 raw bytes, a count, eleven zero sizes
        let mut chunk = Vec::new();
        let mut record = [0u8; 36];
        record[15] = 1 << 4; // scanner channel 1
        record[30..32].copy_from_slice(&500u16.to_le_bytes());
        chunk.extend_from_slice(&record);
        chunk.extend_from_slice(&1u32.to_le_bytes());
        for _ in 0..10 {
            chunk.extend_from_slice(&0u32.to_le_bytes());
        }

        let decompressor = Point14Decompressor::new(chunk, true, false, 0).unwrap();
        assert_eq!(decompressor.record_size(), 36);
        assert_eq!(decompressor.current_context, 1);
        assert!(!decompressor.contexts[1].unused);
        assert!(decompressor.contexts[0].unused);
        assert_eq!(decompressor.rgb_contexts[1].last[0], 500);

        let mut out = [0u8; 36];
        decompressor.first_point(&mut out);
        assert_eq!(out, record);
    }

    #[test]
    fn second_point_without_xy_layer_is_an_error() {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&[0u8; 30]);
        chunk.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..9 {
            chunk.extend_from_slice(&0u32.to_le_bytes());
        }
        let mut decompressor = Point14Decompressor::new(chunk, false, false, 0).unwrap();
        let mut out = [0u8; 30];
        assert!(decompressor.decompress_next(&mut out).is_err());
    }

    #[test]
    fn truncated_preamble_is_an_eof() {
        let chunk = vec![0u8; 10];
        assert!(Point14Decompressor::new(chunk, false, false, 0).is_err());
    }

    use crate::laz::test_encoder::{ArithmeticEncoder, IntegerCompressor};

    /// Encoder side mirror of [RgbContext::decompress].
    struct RgbCompressor {
        last: [u16; 3],
        byte_used_model: ArithmeticModel,
        diff_models: Vec<ArithmeticModel>,
    }

    impl RgbCompressor {
        fn new(first: [u16; 3]) -> Self {
            Self {
                last: first,
                byte_used_model: ArithmeticModel::new(128),
                diff_models: (0..6).map(|_| ArithmeticModel::new(256)).collect(),
            }
        }

        fn compress(&mut self, enc: &mut ArithmeticEncoder, rgb: [u16; 3]) {
            let last = self.last;
            let mut sym = (lower_byte(rgb[0]) != lower_byte(last[0])) as u32;
            sym |= ((upper_byte(rgb[0]) != upper_byte(last[0])) as u32) << 1;
            let other = lower_byte(rgb[1]) != lower_byte(rgb[0])
                || upper_byte(rgb[1]) != upper_byte(rgb[0])
                || lower_byte(rgb[2]) != lower_byte(rgb[0])
                || upper_byte(rgb[2]) != upper_byte(rgb[0]);
            if other {
                sym |= 1 << 6;
                sym |= ((lower_byte(rgb[1]) != lower_byte(last[1])) as u32) << 2;
                sym |= ((upper_byte(rgb[1]) != upper_byte(last[1])) as u32) << 3;
                sym |= ((lower_byte(rgb[2]) != lower_byte(last[2])) as u32) << 4;
                sym |= ((upper_byte(rgb[2]) != upper_byte(last[2])) as u32) << 5;
            }
            enc.encode_symbol(&mut self.byte_used_model, sym);
            if sym & (1 << 0) != 0 {
                let corr = lower_byte(rgb[0]) - lower_byte(last[0]);
                enc.encode_symbol(&mut self.diff_models[0], u8_fold(corr) as u32);
            }
            if sym & (1 << 1) != 0 {
                let corr = upper_byte(rgb[0]) - upper_byte(last[0]);
                enc.encode_symbol(&mut self.diff_models[1], u8_fold(corr) as u32);
            }
            if other {
                let mut diff = lower_byte(rgb[0]) - lower_byte(last[0]);
                if sym & (1 << 2) != 0 {
                    let corr = lower_byte(rgb[1]) - u8_clamp(diff + lower_byte(last[1])) as i32;
                    enc.encode_symbol(&mut self.diff_models[2], u8_fold(corr) as u32);
                }
                if sym & (1 << 4) != 0 {
                    diff = (diff + (lower_byte(rgb[1]) - lower_byte(last[1]))) / 2;
                    let corr = lower_byte(rgb[2]) - u8_clamp(diff + lower_byte(last[2])) as i32;
                    enc.encode_symbol(&mut self.diff_models[4], u8_fold(corr) as u32);
                }
                let mut diff = upper_byte(rgb[0]) - upper_byte(last[0]);
                if sym & (1 << 3) != 0 {
                    let corr = upper_byte(rgb[1]) - u8_clamp(diff + upper_byte(last[1])) as i32;
                    enc.encode_symbol(&mut self.diff_models[3], u8_fold(corr) as u32);
                }
                if sym & (1 << 5) != 0 {
                    diff = (diff + (upper_byte(rgb[1]) - upper_byte(last[1]))) / 2;
                    let corr = upper_byte(rgb[2]) - u8_clamp(diff + upper_byte(last[2])) as i32;
                    enc.encode_symbol(&mut self.diff_models[5], u8_fold(corr) as u32);
                }
            }
            self.last = rgb;
        }
    }

    #[test]
    fn rgb_roundtrip() {
        let first: [u16; 3] = [0x1234, 0x1234, 0x1234];
        let colors: Vec<[u16; 3]> = vec![
            [0x1234, 0x1234, 0x1234], // unchanged
            [0x1290, 0x1290, 0x1290], // grey, low byte moves
            [0x2290, 0x1290, 0x0290], // channels split
            [0x2291, 0x1395, 0x0188],
            [0xFFFF, 0x0000, 0x8080],
            [0xFFFF, 0x0000, 0x8080], // unchanged again
            [0x0102, 0x0304, 0x0506],
        ];

        let mut enc = ArithmeticEncoder::new();
        let mut compressor = RgbCompressor::new(first);
        for &rgb in &colors {
            compressor.compress(&mut enc, rgb);
        }
        let bytes = enc.done();

        let mut ctx = RgbContext::new();
        ctx.init_from(first);
        let mut dec = ArithmeticDecoder::new(ByteSource::new(bytes));
        dec.read_init_bytes().unwrap();
        for (i, &want) in colors.iter().enumerate() {
            ctx.decompress(&mut dec).unwrap();
            assert_eq!(ctx.last, want, "color {i}");
        }
    }

    #[test]
    fn nir_roundtrip() {
        let first = 0xABCDu16;
        let values: Vec<u16> = vec![0xABCD, 0xAB00, 0x1200, 0x12FF, 0xFFFF, 0xFFFF, 0x0001];

        let mut enc = ArithmeticEncoder::new();
        let mut byte_used = ArithmeticModel::new(4);
        let mut diffs = [ArithmeticModel::new(256), ArithmeticModel::new(256)];
        let mut last = first;
        for &nir in &values {
            let mut sym = (lower_byte(nir) != lower_byte(last)) as u32;
            sym |= ((upper_byte(nir) != upper_byte(last)) as u32) << 1;
            enc.encode_symbol(&mut byte_used, sym);
            if sym & 1 != 0 {
                let corr = lower_byte(nir) - lower_byte(last);
                enc.encode_symbol(&mut diffs[0], u8_fold(corr) as u32);
            }
            if sym & 2 != 0 {
                let corr = upper_byte(nir) - upper_byte(last);
                enc.encode_symbol(&mut diffs[1], u8_fold(corr) as u32);
            }
            last = nir;
        }
        let bytes = enc.done();

        let mut ctx = NirContext::new();
        ctx.init_from(first);
        let mut dec = ArithmeticDecoder::new(ByteSource::new(bytes));
        dec.read_init_bytes().unwrap();
        for (i, &want) in values.iter().enumerate() {
            ctx.decompress(&mut dec).unwrap();
            assert_eq!(ctx.last, want, "value {i}");
        }
    }

    #[test]
    fn gps_time_history_roundtrip() {
        let start_bits = 500_000i64;
        let stamp = 9_876_543_210_123u64;

        let mut enc = ArithmeticEncoder::new();
        let mut m_0diff = ArithmeticModel::new(5);
        let mut m_multi = ArithmeticModel::new(GPS_TIME_MULTI_TOTAL as u32);
        let mut ic = IntegerCompressor::new(32, 9);

        // a fresh 32 bit difference
        enc.encode_symbol(&mut m_0diff, 1);
        ic.compress(&mut enc, 0, 1000, 0);
        // roughly the same difference again
        enc.encode_symbol(&mut m_multi, 1);
        ic.compress(&mut enc, 1000, 1003, 1);
        // twice the stored difference
        enc.encode_symbol(&mut m_multi, 2);
        ic.compress(&mut enc, 2000, 2001, 2);
        // no change at all
        enc.encode_symbol(&mut m_multi, GPS_TIME_MULTI_UNCHANGED as u32);
        // a full 64 bit stamp, opening the next history slot
        enc.encode_symbol(&mut m_multi, GPS_TIME_MULTI_CODE_FULL as u32);
        ic.compress(&mut enc, 0, (stamp >> 32) as i32, 8);
        enc.write_short((stamp & 0xFFFF) as u16);
        enc.write_short(((stamp >> 16) & 0xFFFF) as u16);
        let bytes = enc.done();

        let mut ctx = ChannelContext::new();
        let first = Point14 {
            gps_time: f64::from_bits(start_bits as u64),
            ..Default::default()
        };
        ctx.init_from(&first);
        let mut dec = ArithmeticDecoder::new(ByteSource::new(bytes));
        dec.read_init_bytes().unwrap();

        Point14Decompressor::read_gps_time(&mut ctx, &mut dec).unwrap();
        assert_eq!(ctx.last_gps_time[0], start_bits + 1000);
        assert_eq!(ctx.last_gps_time_diff[0], 1000);

        Point14Decompressor::read_gps_time(&mut ctx, &mut dec).unwrap();
        assert_eq!(ctx.last_gps_time[0], start_bits + 2003);
        // the stored difference only follows extreme multipliers
        assert_eq!(ctx.last_gps_time_diff[0], 1000);

        Point14Decompressor::read_gps_time(&mut ctx, &mut dec).unwrap();
        assert_eq!(ctx.last_gps_time[0], start_bits + 4004);

        Point14Decompressor::read_gps_time(&mut ctx, &mut dec).unwrap();
        assert_eq!(ctx.last_gps_time[0], start_bits + 4004);

        Point14Decompressor::read_gps_time(&mut ctx, &mut dec).unwrap();
        assert_eq!(ctx.gps_last, 1);
        assert_eq!(ctx.last_gps_time[1] as u64, stamp);
        assert_eq!(ctx.last_gps_time_diff[1], 0);
    }
}
