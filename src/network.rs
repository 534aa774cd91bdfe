//! Host side of offloaded networks: a classifier with a fully connected head and a
//! detector with a convolutional one.
use crate::accel::Accelerator;
use crate::error::{QnnError, Result};
use crate::params::{ClassifierParams, DetectorParams};
use crate::quantize::{normalize_max, qrelu, quantize, quantize_levels, softmax, top_n};
use crate::session::AcceleratorSession;
use crate::shape::{hwc_to_chw, nhwc_to_nchw};
use ndarray::{Array1, Array3, Array4, Axis};

/// First conv in software, the middle layers on the accelerator, the fc stack in software.
pub struct Classifier<A: Accelerator> {
    session: AcceleratorSession<A>,
    params: ClassifierParams,
}

impl<A: Accelerator> Classifier<A> {
    /// `session` should already be initialized; nothing is offloaded until it is.
    pub fn new(session: AcceleratorSession<A>, params: ClassifierParams) -> Self {
        Classifier { session, params }
    }
    pub fn session(&self) -> &AcceleratorSession<A> {
        &self.session
    }
    pub fn session_mut(&mut self) -> &mut AcceleratorSession<A> {
        &mut self.session
    }
    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    /// Packed accelerator input for a `(1, c, h, w)` image.
    fn offload_input(&self, image: &Array4<f32>) -> Result<Vec<u8>> {
        let levels = self.params.conv0.forward_levels(image)?;
        self.session.prepare_buffer(&levels)
    }

    /// Flattened, max normalized output of the accelerated layers.
    pub fn features(&mut self, image: &Array4<f32>) -> Result<Array1<f32>> {
        let input = self.offload_input(image)?;
        let (channels, dim) = self.session.layers()?.output_shape(&self.params.offload_output)?;
        let mut output = self.session.allocate_buffer(channels, dim)?;
        let bytes = output
            .as_slice_mut()
            .ok_or_else(|| QnnError::shape(&[dim, dim, channels], &[]))?;
        self.session.run_inference(&input, bytes)?;
        let flat = self.session.postprocess_buffer(bytes, (dim, dim, channels))?;
        debug!("{} accelerator outputs from {}", flat.len(), self.params.offload_output);
        Ok(normalize_max(&flat))
    }

    /// Class probabilities.
    pub fn classify(&mut self, image: &Array4<f32>) -> Result<Array1<f32>> {
        let x = self.features(image)?;
        let x = self.params.fc0.forward(&x)?;
        let x = quantize(&qrelu(&x), self.params.hidden_bits)?;
        let x = self.params.fc1.forward(&x)?;
        let x = self.params.fct.forward(&qrelu(&x))?;
        Ok(softmax(&x))
    }

    /// Indices of the `n` most likely classes, best first.
    pub fn top_n(&mut self, image: &Array4<f32>, n: usize) -> Result<Vec<usize>> {
        let probabilities = self.classify(image)?;
        Ok(top_n(&probabilities.to_vec(), n))
    }

    /// Class names of `top_n`, falling back to the index for unnamed classes.
    pub fn top_n_labels(&mut self, image: &Array4<f32>, n: usize) -> Result<Vec<String>> {
        let indices = self.top_n(image, n)?;
        let classes = &self.params.classes;
        Ok(indices
            .into_iter()
            .map(|i| classes.get(i).cloned().unwrap_or_else(|| i.to_string()))
            .collect())
    }
}

/// First conv in software, the middle layers on the accelerator, a final conv in software whose
/// raw output goes to region detection.
pub struct Detector<A: Accelerator> {
    session: AcceleratorSession<A>,
    params: DetectorParams,
}

impl<A: Accelerator> Detector<A> {
    /// `session` should already be initialized; nothing is offloaded until it is.
    pub fn new(session: AcceleratorSession<A>, params: DetectorParams) -> Self {
        Detector { session, params }
    }
    pub fn session(&self) -> &AcceleratorSession<A> {
        &self.session
    }
    pub fn session_mut(&mut self) -> &mut AcceleratorSession<A> {
        &mut self.session
    }
    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// `conv0` levels for a `(1, c, h, w)` image: the activations are clipped to
    /// `[0, clip_max]` and quantized to the accelerator's activation width.
    pub fn input_levels(&self, image: &Array4<f32>) -> Result<Array3<u8>> {
        let clip_max = self.params.clip_max;
        if clip_max.is_nan() || clip_max <= 0.0 {
            return Err(QnnError::InvalidThresholds(format!("clip range {} is not positive", clip_max)));
        }
        let bits = self.session.activation_bits()?;
        let x = self.params.conv0.forward(image)?;
        quantize_levels(&x.mapv(|v| v / clip_max), bits.get())
    }

    /// `(channels, dim, dim)` levels written by the accelerated layers.
    pub fn features(&mut self, image: &Array4<f32>) -> Result<Array3<u8>> {
        let input = self.session.prepare_buffer(&self.input_levels(image)?)?;
        let (channels, dim) = self.session.layers()?.output_shape(&self.params.offload_output)?;
        let mut output = self.session.allocate_buffer(channels, dim)?;
        let bytes = output
            .as_slice_mut()
            .ok_or_else(|| QnnError::shape(&[dim, dim, channels], &[]))?;
        self.session.run_inference(&input, bytes)?;
        let levels = self.session.postprocess_levels(bytes, (dim, dim, channels))?;
        Ok(hwc_to_chw(&levels))
    }

    /// Raw `(out_ch, h, w)` output of the last conv for a `(1, c, h, w)` image.
    pub fn detect(&mut self, image: &Array4<f32>) -> Result<Array3<f32>> {
        let features = self.features(image)?.mapv(f32::from).insert_axis(Axis(0));
        debug!("{:?} accelerator outputs from {}", features.dim(), self.params.offload_output);
        self.params.conv_out.forward(&features)
    }

    /// `detect` for a `(1, h, w, c)` image.
    pub fn detect_nhwc(&mut self, image: &Array4<f32>) -> Result<Array3<f32>> {
        self.detect(&nhwc_to_nchw(image))
    }
}
