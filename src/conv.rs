use crate::error::{QnnError, Result};
use crate::image2d::image_to_column;
use crate::shape::ConvGeometry;
use ndarray::{Array1, Array2, Array3, Array4, Axis};

/// `input` is `(n, in_ch, h, w)`, `weights` is `(out_ch, in_ch, k_h, k_w)`.
/// Returns `(n, out_ch, out_h, out_w)`.
pub fn conv2d(
    input: &Array4<f32>,
    weights: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    stride: usize,
    padding: usize,
) -> Result<Array4<f32>> {
    let (n, in_ch, h, w) = input.dim();
    let (out_ch, w_in_ch, k_h, k_w) = weights.dim();
    if w_in_ch != in_ch {
        return Err(QnnError::shape(&[out_ch, in_ch, k_h, k_w], weights.shape()));
    }
    if let Some(bias) = bias {
        if bias.len() != out_ch {
            return Err(QnnError::shape(&[out_ch], bias.shape()));
        }
    }
    let geometry = ConvGeometry::new(k_h, k_w, stride, padding);
    let (out_h, out_w) = geometry.output_dims(h, w)?;

    let columns = image_to_column(input, &geometry)?;
    let patch_len = geometry.patch_len(in_ch);
    let w_col = Array2::from_shape_vec((out_ch, patch_len), weights.iter().cloned().collect())
        .map_err(|_| QnnError::shape(&[out_ch, in_ch, k_h, k_w], weights.shape()))?;

    let mut out = w_col.dot(&columns);
    if let Some(bias) = bias {
        out += &bias.view().insert_axis(Axis(1));
    }

    // columns are (window, batch) with the batch index varying fastest
    let flat = [out_ch, out_h * out_w * n];
    let out = out
        .into_shape((out_ch, out_h, out_w, n))
        .map_err(|_| QnnError::shape(&[out_ch, out_h, out_w, n], &flat))?;
    Ok(out.permuted_axes([3, 0, 1, 2]).as_standard_layout().into_owned())
}

/// Single image convolution as used on the host side of the offload pipeline.
pub fn conv_layer(
    input: &Array4<f32>,
    weights: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    stride: usize,
    padding: usize,
) -> Result<Array3<f32>> {
    let (n, c, h, w) = input.dim();
    if n != 1 {
        return Err(QnnError::shape(&[1, c, h, w], input.shape()));
    }
    Ok(conv2d(input, weights, bias, stride, padding)?.index_axis_move(Axis(0), 0))
}

/// `x . W + b` with `W` laid out as `(in, out)`.
pub fn fully_connected(x: &Array1<f32>, weights: &Array2<f32>, bias: &Array1<f32>) -> Result<Array1<f32>> {
    let (n_in, n_out) = weights.dim();
    if x.len() != n_in {
        return Err(QnnError::shape(&[n_in], x.shape()));
    }
    if bias.len() != n_out {
        return Err(QnnError::shape(&[n_out], bias.shape()));
    }
    Ok(x.dot(weights) + bias)
}
