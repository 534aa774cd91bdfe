//! The accelerator's packed activation format.
//!
//! Every pixel of an `(h, w, c)` tensor of `a` bit levels becomes one byte aligned row of
//! `ceil(c * a / 8)` bytes. Inside a row the channel values are laid out as one little endian
//! bit stream: bit `i` of channel `k` lands on stream position `k * a + i`, and stream position
//! `p` is bit `p % 8` of byte `p / 8`. Unused bits at the end of the row are zero.
//!
//! This is the same layout as unpacking each byte MSB first, keeping the low `a` bits,
//! reversing them, concatenating the channels, zero padding to a multiple of 8, reversing every
//! 8 bit chunk and packing MSB first again. The tests check the shift based version against
//! that literal bit shuffle.
use crate::error::{QnnError, Result};
use crate::shape::chw_to_hwc;
use ndarray::{Array1, Array3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Bits per activation, 1 to 8 inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ActivationBits(u8);

impl ActivationBits {
    pub const MAX: u32 = 8;

    pub fn new(bits: u32) -> Result<Self> {
        if bits == 0 || bits > Self::MAX {
            return Err(QnnError::UnsupportedBitWidth { bits });
        }
        Ok(ActivationBits(bits as u8))
    }
    pub fn get(self) -> u32 {
        self.0 as u32
    }
    /// Largest representable level, `2^a - 1`.
    pub fn max_level(self) -> u8 {
        ((1u16 << self.0) - 1) as u8
    }
    pub fn packed_row_len(self, channels: usize) -> usize {
        (channels * self.0 as usize + 7) / 8
    }
}

impl TryFrom<u32> for ActivationBits {
    type Error = QnnError;
    fn try_from(bits: u32) -> Result<Self> {
        ActivationBits::new(bits)
    }
}

impl From<ActivationBits> for u32 {
    fn from(bits: ActivationBits) -> u32 {
        bits.get()
    }
}

impl fmt::Display for ActivationBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bit", self.0)
    }
}

/// Shape of a packed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub bits: ActivationBits,
}

impl PackedLayout {
    pub fn new((height, width, channels): (usize, usize, usize), bits: ActivationBits) -> Self {
        PackedLayout {
            height,
            width,
            channels,
            bits,
        }
    }
    pub fn n_pixels(&self) -> usize {
        self.height * self.width
    }
    pub fn row_len(&self) -> usize {
        self.bits.packed_row_len(self.channels)
    }
    /// `h * w * ceil(c * a / 8)`
    pub fn packed_len(&self) -> usize {
        self.n_pixels() * self.row_len()
    }
    /// Bytes per pixel of `buffer`: either tightly packed rows or one byte per channel, the
    /// `(h, w, c)` buffers the accelerator writes into.
    fn pixel_stride(&self, buffer_len: usize) -> Result<usize> {
        let pixels = self.n_pixels();
        if pixels == 0 {
            return if buffer_len == 0 {
                Ok(0)
            } else {
                Err(QnnError::shape(&[0], &[buffer_len]))
            };
        }
        if buffer_len == self.packed_len() {
            return Ok(self.row_len());
        }
        if buffer_len == pixels * self.channels && self.channels >= self.row_len() {
            return Ok(self.channels);
        }
        Err(QnnError::shape(&[self.packed_len()], &[buffer_len]))
    }
}

fn pack_pixel(values: &[u8], bits: ActivationBits, packed: &mut [u8]) {
    let mask = bits.max_level();
    let width = bits.get();
    let mut acc = 0u16;
    let mut filled = 0u32;
    let mut i = 0;
    for &v in values {
        acc |= ((v & mask) as u16) << filled;
        filled += width;
        if filled >= 8 {
            packed[i] = acc as u8;
            i += 1;
            acc >>= 8;
            filled -= 8;
        }
    }
    if filled > 0 {
        packed[i] = acc as u8;
    }
}

fn unpack_pixel(packed: &[u8], bits: ActivationBits, values: &mut [u8]) {
    let mask = bits.max_level();
    let width = bits.get();
    let mut bytes = packed.iter();
    let mut acc = 0u16;
    let mut filled = 0u32;
    for v in values.iter_mut() {
        if filled < width {
            acc |= (*bytes.next().unwrap_or(&0) as u16) << filled;
            filled += 8;
        }
        *v = acc as u8 & mask;
        acc >>= width;
        filled -= width;
    }
}

/// Pack an `(h, w, c)` tensor of levels. Only the low `a` bits of every value are kept,
/// values above `2^a - 1` are not representable.
pub fn pack(tensor: &Array3<u8>, bits: ActivationBits) -> Vec<u8> {
    let layout = PackedLayout::new(tensor.dim(), bits);
    let mut packed = vec![0u8; layout.packed_len()];
    if packed.is_empty() {
        return packed;
    }
    let values: Vec<u8> = tensor.iter().cloned().collect();
    if let Some(v) = values.iter().find(|&&v| v > bits.max_level()) {
        warn!("level {} does not fit in {}, high bits are dropped", v, bits);
    }
    debug!(
        "packing {}x{}x{} at {} into {} bytes",
        layout.height,
        layout.width,
        layout.channels,
        bits,
        packed.len()
    );
    packed
        .par_chunks_mut(layout.row_len())
        .zip(values.par_chunks(layout.channels))
        .for_each(|(row, pixel)| pack_pixel(pixel, bits, row));
    packed
}

/// `pack` for a `(c, h, w)` tensor, as produced by the software conv + threshold layers.
pub fn pack_chw(tensor: &Array3<u8>, bits: ActivationBits) -> Vec<u8> {
    pack(&chw_to_hwc(tensor), bits)
}

/// Decode a packed buffer back into `(h, w, c)` levels.
///
/// `buffer` holds one row per pixel. Rows may be wider than `ceil(c * a / 8)` bytes, in which
/// case only the leading packed bytes of each row are read.
pub fn unpack_levels(
    buffer: &[u8],
    bits: ActivationBits,
    shape: (usize, usize, usize),
) -> Result<Array3<u8>> {
    let layout = PackedLayout::new(shape, bits);
    let stride = layout.pixel_stride(buffer.len())?;
    let mut values = vec![0u8; layout.n_pixels() * layout.channels];
    if !values.is_empty() {
        let row_len = layout.row_len();
        values
            .par_chunks_mut(layout.channels)
            .zip(buffer.par_chunks(stride))
            .for_each(|(pixel, row)| unpack_pixel(&row[..row_len], bits, pixel));
    }
    Array3::from_shape_vec(shape, values).map_err(|_| QnnError::shape(&[shape.0, shape.1, shape.2], &[buffer.len()]))
}

/// Decode into a flat `h * w * c` float vector in `(h, w, c)` order; the fully connected
/// layers consuming it do not care about the spatial layout.
pub fn unpack(buffer: &[u8], bits: ActivationBits, shape: (usize, usize, usize)) -> Result<Array1<f32>> {
    let levels = unpack_levels(buffer, bits, shape)?;
    Ok(levels.iter().map(|&v| v as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::{pack, pack_chw, unpack, unpack_levels, ActivationBits, PackedLayout};
    use crate::error::QnnError;
    use ndarray::{Array, Array3};
    use rand::Rng;
    use rand::SeedableRng;
    use rand_hc::Hc128Rng;

    fn unpackbits(byte: u8) -> Vec<u8> {
        (0..8).rev().map(|i| (byte >> i) & 1).collect()
    }

    fn packbits(bits: &[u8]) -> u8 {
        bits.iter().fold(0u8, |acc, &b| (acc << 1) | b)
    }

    // literal unpackbits / flip / packbits shuffle
    fn pack_pixel_slow(values: &[u8], a: usize) -> Vec<u8> {
        let mut stream = vec![];
        for &v in values {
            let mut kept = unpackbits(v)[8 - a..].to_vec();
            kept.reverse();
            stream.extend(kept);
        }
        while stream.len() % 8 != 0 {
            stream.push(0);
        }
        stream
            .chunks(8)
            .map(|chunk| {
                let mut chunk = chunk.to_vec();
                chunk.reverse();
                packbits(&chunk)
            })
            .collect()
    }

    fn unpack_pixel_slow(row: &[u8], a: usize, channels: usize) -> Vec<u8> {
        let mut stream = vec![];
        for &byte in row {
            let mut bits = unpackbits(byte);
            bits.reverse();
            stream.extend(bits);
        }
        stream.truncate(channels * a);
        stream
            .chunks(a)
            .map(|chunk| {
                let mut value = vec![0u8; 8 - a];
                value.extend(chunk.iter().rev());
                packbits(&value)
            })
            .collect()
    }

    fn random_levels<R: Rng>(rng: &mut R, shape: (usize, usize, usize), bits: ActivationBits) -> Array3<u8> {
        Array::from_shape_fn(shape, |_| rng.gen_range(0..=bits.max_level()))
    }

    const SHAPES: [(usize, usize, usize); 6] = [(1, 1, 1), (2, 3, 3), (4, 4, 7), (3, 5, 8), (5, 2, 13), (7, 7, 64)];

    #[test]
    fn bit_width_limits() {
        assert!(matches!(ActivationBits::new(0), Err(QnnError::UnsupportedBitWidth { bits: 0 })));
        assert!(matches!(ActivationBits::new(9), Err(QnnError::UnsupportedBitWidth { bits: 9 })));
        assert_eq!(ActivationBits::new(8).unwrap().max_level(), 255);
        assert_eq!(ActivationBits::new(3).unwrap().max_level(), 7);
        assert_eq!(ActivationBits::new(3).unwrap().packed_row_len(3), 2);
        assert_eq!(ActivationBits::new(2).unwrap().packed_row_len(256), 64);
    }

    #[test]
    fn known_rows() {
        let a2 = ActivationBits::new(2).unwrap();
        let t = Array::from_shape_vec((1, 1, 3), vec![1u8, 2, 3]).unwrap();
        assert_eq!(pack(&t, a2), vec![0b0011_1001]);

        let a1 = ActivationBits::new(1).unwrap();
        let t = Array::from_shape_vec((1, 1, 10), vec![1u8, 0, 1, 1, 0, 0, 0, 0, 1, 1]).unwrap();
        assert_eq!(pack(&t, a1), vec![0b0000_1101, 0b0000_0011]);

        let a3 = ActivationBits::new(3).unwrap();
        let t = Array::from_shape_vec((1, 1, 3), vec![7u8, 0, 5]).unwrap();
        assert_eq!(pack(&t, a3), vec![0b0100_0111, 0b0000_0001]);

        let a8 = ActivationBits::new(8).unwrap();
        let t = Array::from_shape_vec((1, 2, 2), vec![200u8, 1, 0, 255]).unwrap();
        assert_eq!(pack(&t, a8), vec![200, 1, 0, 255]);
    }

    #[test]
    fn matches_bit_shuffle() {
        let mut rng = Hc128Rng::seed_from_u64(0);
        for a in 1..=8 {
            let bits = ActivationBits::new(a).unwrap();
            for &shape in SHAPES.iter() {
                let t = random_levels(&mut rng, shape, bits);
                let packed = pack(&t, bits);
                let row_len = bits.packed_row_len(shape.2);
                for (p, pixel) in t.as_slice().unwrap().chunks(shape.2).enumerate() {
                    let row = &packed[p * row_len..(p + 1) * row_len];
                    assert_eq!(row.to_vec(), pack_pixel_slow(pixel, a as usize));
                    assert_eq!(unpack_pixel_slow(row, a as usize, shape.2), pixel.to_vec());
                }
            }
        }
    }

    #[test]
    fn round_trip() {
        let mut rng = Hc128Rng::seed_from_u64(0);
        for a in 1..=8 {
            let bits = ActivationBits::new(a).unwrap();
            for &shape in SHAPES.iter() {
                let t = random_levels(&mut rng, shape, bits);
                let packed = pack(&t, bits);
                assert_eq!(packed.len(), PackedLayout::new(shape, bits).packed_len());
                assert_eq!(packed.len(), shape.0 * shape.1 * ((shape.2 * a as usize + 7) / 8));
                assert_eq!(unpack_levels(&packed, bits, shape).unwrap(), t);
                let flat = unpack(&packed, bits, shape).unwrap();
                assert_eq!(flat.len(), shape.0 * shape.1 * shape.2);
                assert!(flat.iter().zip(t.iter()).all(|(&f, &v)| f == v as f32));
            }
        }
    }

    #[test]
    fn pad_bits_are_zero() {
        let a3 = ActivationBits::new(3).unwrap();
        let t = Array3::from_elem((2, 2, 3), 7u8);
        for row in pack(&t, a3).chunks(2) {
            assert_eq!(row, &[0xffu8, 0x01]);
        }
    }

    #[test]
    fn high_bits_dropped() {
        let a2 = ActivationBits::new(2).unwrap();
        let t = Array::from_shape_vec((1, 1, 2), vec![5u8, 255]).unwrap();
        let packed = pack(&t, a2);
        assert_eq!(unpack_levels(&packed, a2, (1, 1, 2)).unwrap().into_raw_vec(), vec![1, 3]);
    }

    #[test]
    fn wide_output_rows() {
        // accelerator output buffers are allocated as (dim, dim, channels) bytes
        let mut rng = Hc128Rng::seed_from_u64(0);
        let bits = ActivationBits::new(2).unwrap();
        let shape = (3, 3, 20);
        let t = random_levels(&mut rng, shape, bits);
        let packed = pack(&t, bits);
        let row_len = bits.packed_row_len(shape.2);
        let mut buffer: Vec<u8> = (0..3 * 3 * 20).map(|_| rng.gen()).collect();
        for p in 0..9 {
            buffer[p * 20..p * 20 + row_len].copy_from_slice(&packed[p * row_len..(p + 1) * row_len]);
        }
        assert_eq!(unpack_levels(&buffer, bits, shape).unwrap(), t);
    }

    #[test]
    fn length_mismatch() {
        let bits = ActivationBits::new(3).unwrap();
        // 4 pixels of 2 bytes
        assert!(unpack_levels(&[0u8; 8], bits, (2, 2, 3)).is_ok());
        assert!(matches!(
            unpack_levels(&[0u8; 7], bits, (2, 2, 3)),
            Err(QnnError::ShapeMismatch { .. })
        ));
        // one byte per pixel is narrower than a packed row
        assert!(matches!(
            unpack_levels(&[0u8; 4], bits, (2, 2, 3)),
            Err(QnnError::ShapeMismatch { .. })
        ));
        // packed rows of a larger tensor
        let wider = Array::from_shape_fn((2, 4, 3), |(h, w, c)| ((h + w + c) % 8) as u8);
        let packed = pack(&wider, bits);
        assert_eq!(packed.len(), 16);
        assert!(matches!(
            unpack_levels(&packed, bits, (2, 2, 3)),
            Err(QnnError::ShapeMismatch { .. })
        ));
        assert!(unpack_levels(&[0u8; 20], bits, (2, 2, 3)).is_err());
        assert!(unpack_levels(&[0u8; 12], bits, (2, 2, 3)).is_ok());
        assert!(unpack_levels(&[], bits, (0, 2, 3)).is_ok());
        assert!(unpack_levels(&[1], bits, (0, 2, 3)).is_err());
    }

    #[test]
    fn chw_input() {
        let bits = ActivationBits::new(2).unwrap();
        let chw = Array::from_shape_fn((5, 2, 3), |(c, h, w)| ((c + h + w) % 4) as u8);
        let packed = pack_chw(&chw, bits);
        let hwc = unpack_levels(&packed, bits, (2, 3, 5)).unwrap();
        assert_eq!(hwc[[1, 2, 4]], chw[[4, 1, 2]]);
        assert_eq!(crate::shape::hwc_to_chw(&hwc), chw);
    }

    #[test]
    fn serde_bits() {
        let bits: ActivationBits = serde_json::from_str("3").unwrap();
        assert_eq!(bits.get(), 3);
        assert!(serde_json::from_str::<ActivationBits>("9").is_err());
        assert_eq!(serde_json::to_string(&bits).unwrap(), "3");
    }
}
