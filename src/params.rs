//! Learned parameters of the software layers, stored as bincode files.
use crate::conv::{conv_layer, fully_connected};
use crate::error::{QnnError, Result};
use crate::quantize::{threshold, ThresholdSet};
use bincode::{deserialize_from, serialize_into};
use ndarray::{Array1, Array2, Array3, Array4};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConvParams {
    /// `(out_ch, in_ch, k, k)`
    pub weights: Array4<f32>,
    pub bias: Option<Array1<f32>>,
    /// Cut points turning the conv output into accelerator levels.
    pub thresholds: Option<ThresholdSet>,
    pub stride: usize,
    pub padding: usize,
}

impl ConvParams {
    /// `(1, c, h, w)` image to `(out_ch, out_h, out_w)` activations.
    pub fn forward(&self, image: &Array4<f32>) -> Result<Array3<f32>> {
        conv_layer(image, &self.weights, self.bias.as_ref(), self.stride, self.padding)
    }
    /// `forward` followed by thresholding.
    pub fn forward_levels(&self, image: &Array4<f32>) -> Result<Array3<u8>> {
        let thresholds = self
            .thresholds
            .as_ref()
            .ok_or_else(|| QnnError::InvalidThresholds("conv layer has no thresholds".to_string()))?;
        threshold(&self.forward(image)?, thresholds)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FcParams {
    /// `(in, out)`
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl FcParams {
    pub fn forward(&self, x: &Array1<f32>) -> Result<Array1<f32>> {
        fully_connected(x, &self.weights, &self.bias)
    }
    pub fn n_inputs(&self) -> usize {
        self.weights.nrows()
    }
    pub fn n_outputs(&self) -> usize {
        self.weights.ncols()
    }
}

fn default_hidden_bits() -> u32 {
    2
}

/// Everything the host runs around the accelerated layers of a classifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassifierParams {
    pub conv0: ConvParams,
    /// Name of the last accelerated layer in the layer table, its output feeds `fc0`.
    pub offload_output: String,
    pub fc0: FcParams,
    pub fc1: FcParams,
    pub fct: FcParams,
    /// Width the first hidden fc activations are quantized to.
    #[serde(default = "default_hidden_bits")]
    pub hidden_bits: u32,
    #[serde(default)]
    pub classes: Vec<String>,
}

fn default_clip_max() -> f32 {
    4.0
}

/// Host layers of a detector: the first conv, whose clipped output is quantized to the
/// accelerator's activation width, and the last conv, fed by the accelerator's feature map.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetectorParams {
    pub conv0: ConvParams,
    /// `conv0` activations are clipped to `[0, clip_max]` before quantization.
    #[serde(default = "default_clip_max")]
    pub clip_max: f32,
    /// Name of the last accelerated layer in the layer table, its output feeds `conv_out`.
    pub offload_output: String,
    pub conv_out: ConvParams,
}

fn load_bincode<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(deserialize_from(reader)?)
}

fn save_bincode<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    Ok(serialize_into(writer, value)?)
}

macro_rules! bincode_file {
    ($type:ty) => {
        impl $type {
            pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
                load_bincode(path)
            }
            pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
                save_bincode(self, path)
            }
        }
    };
}

bincode_file!(ConvParams);
bincode_file!(FcParams);
bincode_file!(ClassifierParams);
bincode_file!(DetectorParams);
