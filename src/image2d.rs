//! im2col / col2im over NCHW tensors.
//!
//! The column matrix has one row per `(channel, ky, kx)` patch element and one column per
//! output pixel (times the batch, batch index varying fastest), so a convolution becomes
//! `weights.dot(&columns)`.
use crate::error::{QnnError, Result};
use crate::shape::ConvGeometry;
use ndarray::{s, Array2, Array4, CowArray, Ix4};

/// Three parallel `(patch_len, out_h * out_w)` index arrays into the zero padded image.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnIndices {
    pub channel: Array2<usize>,
    pub row: Array2<usize>,
    pub col: Array2<usize>,
    pub out_h: usize,
    pub out_w: usize,
}

impl ColumnIndices {
    pub fn new(shape: [usize; 4], geometry: &ConvGeometry) -> Result<Self> {
        let [_, channels, height, width] = shape;
        let (out_h, out_w) = geometry.output_dims(height, width)?;
        let (kh, kw) = (geometry.kernel_h, geometry.kernel_w);
        let dims = (geometry.patch_len(channels), out_h * out_w);
        let stride = geometry.stride;

        Ok(ColumnIndices {
            channel: Array2::from_shape_fn(dims, |(r, _)| r / (kh * kw)),
            row: Array2::from_shape_fn(dims, |(r, l)| (r / kw) % kh + stride * (l / out_w)),
            col: Array2::from_shape_fn(dims, |(r, l)| r % kw + stride * (l % out_w)),
            out_h,
            out_w,
        })
    }
    pub fn patch_len(&self) -> usize {
        self.channel.nrows()
    }
    pub fn n_windows(&self) -> usize {
        self.channel.ncols()
    }
}

fn pad_image(image: &Array4<f32>, padding: usize) -> CowArray<f32, Ix4> {
    if padding == 0 {
        return image.view().into();
    }
    let (n, c, h, w) = image.dim();
    let mut padded = Array4::zeros((n, c, h + 2 * padding, w + 2 * padding));
    padded
        .slice_mut(s![.., .., padding..padding + h, padding..padding + w])
        .assign(image);
    padded.into()
}

pub fn image_to_column(image: &Array4<f32>, geometry: &ConvGeometry) -> Result<Array2<f32>> {
    let (n, c, h, w) = image.dim();
    let indices = ColumnIndices::new([n, c, h, w], geometry)?;
    let padded = pad_image(image, geometry.padding);

    let mut columns = Array2::zeros((indices.patch_len(), indices.n_windows() * n));
    for r in 0..indices.patch_len() {
        for l in 0..indices.n_windows() {
            let (ch, y, x) = (
                indices.channel[[r, l]],
                indices.row[[r, l]],
                indices.col[[r, l]],
            );
            for b in 0..n {
                columns[[r, l * n + b]] = padded[[b, ch, y, x]];
            }
        }
    }
    Ok(columns)
}

/// Inverse reindexing: every column entry is added (not written) into its padded image
/// position, so pixels covered by several windows receive the sum of all of them.
pub fn column_to_image(
    columns: &Array2<f32>,
    shape: [usize; 4],
    geometry: &ConvGeometry,
) -> Result<Array4<f32>> {
    let [n, c, h, w] = shape;
    let indices = ColumnIndices::new(shape, geometry)?;
    let expected = [indices.patch_len(), indices.n_windows() * n];
    if columns.shape() != expected {
        return Err(QnnError::shape(&expected, columns.shape()));
    }
    let p = geometry.padding;

    let mut padded = Array4::<f32>::zeros((n, c, h + 2 * p, w + 2 * p));
    for r in 0..indices.patch_len() {
        for l in 0..indices.n_windows() {
            let (ch, y, x) = (
                indices.channel[[r, l]],
                indices.row[[r, l]],
                indices.col[[r, l]],
            );
            for b in 0..n {
                padded[[b, ch, y, x]] += columns[[r, l * n + b]];
            }
        }
    }

    if p == 0 {
        Ok(padded)
    } else {
        Ok(padded.slice(s![.., .., p..p + h, p..p + w]).to_owned())
    }
}
