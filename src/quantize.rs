//! Numeric kernels that feed and consume the offloaded layers.
use crate::error::{QnnError, Result};
use ndarray::{Array, Array1, Array2, Array3, ArrayBase, Data, Dimension, Ix1};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

const MAX_QUANTIZE_BITS: u32 = 16;

fn grid_levels(bits: u32, max_bits: u32) -> Result<f32> {
    if bits == 0 || bits > max_bits {
        return Err(QnnError::UnsupportedBitWidth { bits });
    }
    Ok(((1u32 << bits) - 1) as f32)
}

/// Snap every element onto the `bits` bit grid `{0, 1/n, .., 1}` with `n = 2^bits - 1`.
/// Ties round to even, matching the numpy reference the parameters were exported against.
/// Values are not clipped.
pub fn quantize<S, D>(x: &ArrayBase<S, D>, bits: u32) -> Result<Array<f32, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let n = grid_levels(bits, MAX_QUANTIZE_BITS)?;
    Ok(x.mapv(|v| (v * n).round_ties_even() / n))
}

/// Integer level form of `quantize` for activations in `[0, 1]`, ready for the bit packer.
pub fn quantize_levels<S, D>(x: &ArrayBase<S, D>, bits: u32) -> Result<Array<u8, D>>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let n = grid_levels(bits, 8)?;
    Ok(x.mapv(|v| (qrelu_value(v) * n).round_ties_even() as u8))
}

fn qrelu_value(v: f32) -> f32 {
    v.max(0.0).min(1.0)
}

pub fn qrelu<S, D>(x: &ArrayBase<S, D>) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    x.mapv(qrelu_value)
}

pub fn softmax<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix1>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exp = x.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Indices of the `n` largest scores, highest first. Equal scores keep their index order,
/// unlike a reversed `argsort` which puts the later index first.
pub fn top_n(scores: &[f32], n: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    indices.truncate(n);
    indices
}

/// Divide by the largest element. An all zero (or all negative) input is returned unchanged.
pub fn normalize_max<S: Data<Elem = f32>>(x: &ArrayBase<S, Ix1>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    if max > 0.0 {
        x.mapv(|v| v / max)
    } else {
        x.to_owned()
    }
}

/// Learned cut points, one row per output channel or a single row shared by all channels.
/// Rows are kept sorted so a level lookup is a binary search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array2<f32>", into = "Array2<f32>")]
pub struct ThresholdSet {
    cuts: Array2<f32>,
}

impl ThresholdSet {
    pub fn new(mut cuts: Array2<f32>) -> Result<Self> {
        if cuts.ncols() > u8::MAX as usize {
            return Err(QnnError::InvalidThresholds(format!(
                "{} cut points per channel do not fit an 8 bit level",
                cuts.ncols()
            )));
        }
        if cuts.iter().any(|t| t.is_nan()) {
            return Err(QnnError::InvalidThresholds("NaN cut point".to_string()));
        }
        for mut row in cuts.rows_mut() {
            let mut sorted: Vec<f32> = row.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            row.iter_mut().zip(sorted).for_each(|(t, s)| *t = s);
        }
        Ok(ThresholdSet { cuts })
    }
    pub fn shared(cuts: Vec<f32>) -> Result<Self> {
        let n = cuts.len();
        let cuts = Array2::from_shape_vec((1, n), cuts)
            .map_err(|_| QnnError::InvalidThresholds("bad cut point vector".to_string()))?;
        Self::new(cuts)
    }
    pub fn n_channels(&self) -> usize {
        self.cuts.nrows()
    }
    pub fn n_thresholds(&self) -> usize {
        self.cuts.ncols()
    }
    /// `a` such that there are `2^a - 1` cut points per channel, if any.
    pub fn activation_bits(&self) -> Option<u32> {
        (1..=8).find(|&a| (1usize << a) - 1 == self.n_thresholds())
    }
    /// Number of cut points of `channel` that `x` strictly exceeds.
    pub fn level(&self, channel: usize, x: f32) -> u8 {
        let row = if self.cuts.nrows() == 1 { 0 } else { channel };
        let cuts = self.cuts.row(row);
        match cuts.as_slice() {
            Some(cuts) => cuts.partition_point(|&t| t < x) as u8,
            None => cuts.iter().filter(|&&t| x > t).count() as u8,
        }
    }
}

impl TryFrom<Array2<f32>> for ThresholdSet {
    type Error = QnnError;
    fn try_from(cuts: Array2<f32>) -> Result<Self> {
        Self::new(cuts)
    }
}

impl From<ThresholdSet> for Array2<f32> {
    fn from(set: ThresholdSet) -> Self {
        set.cuts
    }
}

/// Threshold a `(channels, h, w)` activation map into integer levels.
pub fn threshold(x: &Array3<f32>, thresholds: &ThresholdSet) -> Result<Array3<u8>> {
    let channels = x.dim().0;
    if thresholds.n_channels() != 1 && thresholds.n_channels() != channels {
        return Err(QnnError::shape(
            &[channels, thresholds.n_thresholds()],
            &[thresholds.n_channels(), thresholds.n_thresholds()],
        ));
    }
    Ok(Array3::from_shape_fn(x.dim(), |(c, h, w)| {
        thresholds.level(c, x[[c, h, w]])
    }))
}
