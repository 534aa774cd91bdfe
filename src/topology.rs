//! Descriptors consumed from the overlay and layer JSON files.
use crate::bits::ActivationBits;
use crate::error::{QnnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Static limits of the synthesized overlay. Only `ACTIVATION_BITS` is needed on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NetworkParameters {
    pub activation_bits: u32,
    #[serde(default)]
    pub weights_bits: Option<u32>,
    #[serde(default)]
    pub thresholds_bits: Option<u32>,
    #[serde(default)]
    pub macc_bits: Option<u32>,
    #[serde(default)]
    pub max_k: Option<u32>,
    #[serde(default)]
    pub max_ifm_ch: Option<u32>,
    #[serde(default)]
    pub max_ifm_dim: Option<u32>,
    #[serde(default)]
    pub max_ofm_ch: Option<u32>,
    #[serde(default)]
    pub max_ofm_dim: Option<u32>,
    #[serde(default)]
    pub max_pool_size: Option<u32>,
    #[serde(default)]
    pub max_pool_stride: Option<u32>,
    #[serde(default)]
    pub max_simd: Option<u32>,
    #[serde(default)]
    pub max_pe_conv: Option<u32>,
    #[serde(default)]
    pub max_pe_fc: Option<u32>,
    #[serde(default)]
    pub mem_channels: Option<u32>,
    #[serde(default)]
    pub datawidth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub parameters: NetworkParameters,
}

impl NetworkDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
    /// Validated activation width. Overlays wider than 8 bits parse fine but cannot be packed.
    pub fn activation_bits(&self) -> Result<ActivationBits> {
        ActivationBits::new(self.parameters.activation_bits)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "func")]
pub enum LayerKind {
    #[serde(rename = "conv_layer")]
    Conv {
        kernel_shape: u32,
        kernel_stride: u32,
        padding: f64,
        /// `[channels, dim, dim]`
        input: [u32; 3],
        output: [u32; 3],
    },
    #[serde(rename = "maxpool_layer")]
    MaxPool {
        kernel_shape: u32,
        kernel_stride: u32,
        padding: f64,
        input: [u32; 3],
        output: [u32; 3],
    },
    #[serde(rename = "merge_layer")]
    Merge {
        merge: u32,
        output_channels: u32,
        output_dim: u32,
    },
    #[serde(rename = "split_layer")]
    Split {
        split: u32,
        input_channels: u32,
        input_dim: u32,
    },
    #[serde(rename = "fc_layer")]
    FullyConnected { input: u32, output: u32 },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

impl LayerRecord {
    /// `(channels, dim)` of the feature map this layer consumes.
    pub fn input_shape(&self) -> Option<(usize, usize)> {
        match &self.kind {
            LayerKind::Conv { input, .. } | LayerKind::MaxPool { input, .. } => {
                Some((input[0] as usize, input[1] as usize))
            }
            LayerKind::Split {
                input_channels,
                input_dim,
                ..
            } => Some((*input_channels as usize, *input_dim as usize)),
            LayerKind::Merge {
                merge,
                output_channels,
                output_dim,
            } if *merge > 0 => Some(((output_channels / merge) as usize, *output_dim as usize)),
            _ => None,
        }
    }
    /// `(channels, dim)` of the feature map this layer produces.
    pub fn output_shape(&self) -> Option<(usize, usize)> {
        match &self.kind {
            LayerKind::Conv { output, .. } | LayerKind::MaxPool { output, .. } => {
                Some((output[0] as usize, output[1] as usize))
            }
            LayerKind::Merge {
                output_channels,
                output_dim,
                ..
            } => Some((*output_channels as usize, *output_dim as usize)),
            LayerKind::Split {
                split,
                input_channels,
                input_dim,
            } if *split > 0 => Some(((input_channels / split) as usize, *input_dim as usize)),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct LayerFile {
    layers: Vec<LayerRecord>,
}

/// The `layers` array of the layer JSON, addressable by layer name.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTable {
    layers: Vec<LayerRecord>,
    by_name: HashMap<String, usize>,
}

impl LayerTable {
    pub fn new(layers: Vec<LayerRecord>) -> Self {
        let by_name = layers
            .iter()
            .enumerate()
            .map(|(i, layer)| (layer.name.clone(), i))
            .collect();
        LayerTable { layers, by_name }
    }
    pub fn from_json(json: &str) -> Result<Self> {
        let file: LayerFile = serde_json::from_str(json)?;
        Ok(Self::new(file.layers))
    }
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let file: LayerFile = serde_json::from_reader(reader)?;
        Ok(Self::new(file.layers))
    }
    pub fn get(&self, name: &str) -> Result<&LayerRecord> {
        self.by_name
            .get(name)
            .map(|&i| &self.layers[i])
            .ok_or_else(|| QnnError::MissingLayer(name.to_string()))
    }
    pub fn output_shape(&self, name: &str) -> Result<(usize, usize)> {
        let layer = self.get(name)?;
        layer
            .output_shape()
            .ok_or_else(|| QnnError::MissingLayer(format!("{} has no spatial output", name)))
    }
    pub fn input_shape(&self, name: &str) -> Result<(usize, usize)> {
        let layer = self.get(name)?;
        layer
            .input_shape()
            .ok_or_else(|| QnnError::MissingLayer(format!("{} has no spatial input", name)))
    }
    pub fn len(&self) -> usize {
        self.layers.len()
    }
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, LayerRecord> {
        self.layers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{LayerKind, LayerTable, NetworkDescriptor};
    use crate::error::QnnError;

    const OVERLAY_JSON: &str = r#"{
        "parameters": {
            "MAX_K": 3, "MAX_IFM_CH": 512, "MAX_IFM_DIM": 56, "MAX_OFM_CH": 512,
            "MAX_OFM_DIM": 56, "MAX_POOL_SIZE": 2, "MAX_POOL_STRIDE": 2, "MAX_SIMD": 32,
            "MAX_PE_CONV": 16, "MAX_PE_FC": 0, "MEM_CHANNELS": 2, "ACTIVATION_BITS": 2,
            "WEIGHTS_BITS": 1, "THRESHOLDS_BITS": 16, "MACC_BITS": 16, "DATAWIDTH": 64
        }
    }"#;

    const LAYERS_JSON: &str = r#"{
        "network": "dorefanet",
        "input_image": "",
        "verification_image": "",
        "use_binparams": true,
        "binparam": "binparam-dorefanet",
        "binparam_skip": 0,
        "layer_skip": 1,
        "layers": [
            {"name": "conv0", "func": "conv_layer", "kernel_shape": 12, "kernel_stride": 4,
             "padding": 0, "input": [3, 224, 224], "output": [64, 54, 54]},
            {"name": "conv1", "func": "conv_layer", "kernel_shape": 5, "kernel_stride": 1,
             "padding": 2.0, "input": [64, 54, 54], "output": [192, 54, 54]},
            {"name": "pool1", "func": "maxpool_layer", "kernel_shape": 2, "kernel_stride": 2,
             "padding": 0, "input": [192, 54, 54], "output": [192, 27, 27]},
            {"name": "split2", "func": "split_layer", "split": 2, "input_channels": 384,
             "input_dim": 27},
            {"name": "merge4", "func": "merge_layer", "merge": 2, "output_channels": 256,
             "output_dim": 6},
            {"name": "fc0", "func": "fc_layer", "input": 9216, "output": 4096},
            {"name": "act", "func": "relu"}
        ]
    }"#;

    #[test]
    fn overlay_parameters() {
        let net: NetworkDescriptor = serde_json::from_str(OVERLAY_JSON).unwrap();
        assert_eq!(net.parameters.activation_bits, 2);
        assert_eq!(net.parameters.max_simd, Some(32));
        assert_eq!(net.activation_bits().unwrap().get(), 2);

        let minimal: NetworkDescriptor = serde_json::from_str(r#"{"parameters": {"ACTIVATION_BITS": 12}}"#).unwrap();
        assert_eq!(minimal.parameters.datawidth, None);
        assert!(matches!(
            minimal.activation_bits(),
            Err(QnnError::UnsupportedBitWidth { bits: 12 })
        ));
        assert!(serde_json::from_str::<NetworkDescriptor>(r#"{"parameters": {}}"#).is_err());
    }

    #[test]
    fn layer_table() {
        let table = LayerTable::from_json(LAYERS_JSON).unwrap();
        assert_eq!(table.len(), 7);
        assert_eq!(table.output_shape("conv0").unwrap(), (64, 54));
        assert_eq!(table.input_shape("conv1").unwrap(), (64, 54));
        assert_eq!(table.output_shape("pool1").unwrap(), (192, 27));
        assert_eq!(table.output_shape("split2").unwrap(), (192, 27));
        assert_eq!(table.output_shape("merge4").unwrap(), (256, 6));
        assert_eq!(table.input_shape("merge4").unwrap(), (128, 6));
        assert!(table.output_shape("fc0").is_err());
        assert!(matches!(table.get("conv9"), Err(QnnError::MissingLayer(_))));
        match &table.get("conv1").unwrap().kind {
            LayerKind::Conv { padding, kernel_shape, .. } => {
                assert_eq!(*padding, 2.0);
                assert_eq!(*kernel_shape, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(table.get("fc0").unwrap().kind, LayerKind::FullyConnected { input: 9216, output: 4096 });
        assert_eq!(table.get("act").unwrap().kind, LayerKind::Other);
        let convs: Vec<&str> = table
            .iter()
            .filter(|l| matches!(l.kind, LayerKind::Conv { .. }))
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(convs, vec!["conv0", "conv1"]);
    }
}
