use crate::error::{QnnError, Result};
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};

/// Sliding window parameters shared by im2col, col2im and the conv kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    pub fn new(kernel_h: usize, kernel_w: usize, stride: usize, padding: usize) -> Self {
        ConvGeometry {
            kernel_h,
            kernel_w,
            stride,
            padding,
        }
    }
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Self {
        Self::new(kernel, kernel, stride, padding)
    }
    /// `floor((dim + 2 * pad - k) / stride) + 1` for both spatial axes.
    pub fn output_dims(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        if self.stride == 0 {
            return Err(QnnError::InvalidGeometry("stride must be at least 1".to_string()));
        }
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return Err(QnnError::InvalidGeometry("kernel must be at least 1x1".to_string()));
        }
        let padded_h = height + 2 * self.padding;
        let padded_w = width + 2 * self.padding;
        if self.kernel_h > padded_h || self.kernel_w > padded_w {
            return Err(QnnError::InvalidGeometry(format!(
                "{}x{} kernel does not fit a {}x{} padded input",
                self.kernel_h, self.kernel_w, padded_h, padded_w
            )));
        }
        Ok((
            (padded_h - self.kernel_h) / self.stride + 1,
            (padded_w - self.kernel_w) / self.stride + 1,
        ))
    }
    /// Number of rows of the column matrix for `channels` input channels.
    pub fn patch_len(&self, channels: usize) -> usize {
        channels * self.kernel_h * self.kernel_w
    }
}

// The accelerator consumes (dim, dim, chan) while the software convolutions produce (chan, dim, dim).
pub fn chw_to_hwc<T: Clone>(input: &Array3<T>) -> Array3<T> {
    input.view().permuted_axes([1, 2, 0]).as_standard_layout().into_owned()
}

pub fn hwc_to_chw<T: Clone>(input: &Array3<T>) -> Array3<T> {
    input.view().permuted_axes([2, 0, 1]).as_standard_layout().into_owned()
}

pub fn nhwc_to_nchw<T: Clone>(input: &Array4<T>) -> Array4<T> {
    input
        .view()
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned()
}
