//! Dense convolution kernels.
//!
//! All kernels work on single images laid out as `[channels, rows, cols]`. A forward filter is
//! `[out_channels, in_channels, f, f]`; a transposed filter is `[in_channels, out_channels, f, f]`.

use derive_more::Display;
use itertools::Itertools;

use super::blas::{Transpose, sgemm};
use crate::loom::tensor::{Tensor, TensorView, TensorViewMut};

/// Square filter geometry shared by a convolution and its transpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[display("f{filter_size}s{stride}p{pad}")]
pub struct ConvGeometry {
    pub filter_size: usize,
    pub stride: usize,
    pub pad: usize,
}

impl ConvGeometry {
    /// # Panics
    /// Panics if the filter size or the stride is zero.
    pub fn new(filter_size: usize, stride: usize, pad: usize) -> Self {
        assert!(filter_size > 0, "filter size must be positive");
        assert!(stride > 0, "stride must be positive");
        Self {
            filter_size,
            stride,
            pad,
        }
    }

    /// Output extent of a forward convolution along one axis.
    ///
    /// # Panics
    /// Panics if the filter is larger than the padded input.
    #[inline]
    pub fn output_dim(&self, input: usize) -> usize {
        let padded = input + 2 * self.pad;
        assert!(
            padded >= self.filter_size,
            "filter of size {} larger than padded input {padded}",
            self.filter_size
        );
        (padded - self.filter_size) / self.stride + 1
    }

    /// Output extent of a transposed convolution along one axis.
    ///
    /// # Panics
    /// Panics if the padding is over-full, i.e. `pad >= filter_size`, or if the result is empty.
    #[inline]
    pub fn transposed_output_dim(&self, input: usize) -> usize {
        assert!(
            self.pad < self.filter_size,
            "over-full transposed padding is not supported: {self}"
        );
        let full = self.stride * input.saturating_sub(1) + self.filter_size;
        assert!(
            input > 0 && full > 2 * self.pad,
            "transposed convolution {self} of input {input} is empty"
        );
        full - 2 * self.pad
    }

    #[inline]
    pub fn output_shape(&self, [rows, cols]: [usize; 2]) -> [usize; 2] {
        [self.output_dim(rows), self.output_dim(cols)]
    }

    #[inline]
    pub fn transposed_output_shape(&self, [rows, cols]: [usize; 2]) -> [usize; 2] {
        [
            self.transposed_output_dim(rows),
            self.transposed_output_dim(cols),
        ]
    }

    /// Zero padding the transposed convolution sees around its fractionally strided input.
    ///
    /// # Panics
    /// Panics if `pad >= filter_size`, which is not supported.
    #[inline]
    pub fn virtual_pad(&self) -> usize {
        assert!(
            self.pad < self.filter_size,
            "over-full transposed padding is not supported: {self}"
        );
        self.filter_size - self.pad - 1
    }

    /// Maps a patch position and filter tap to an input coordinate, `None` if it falls in the padding.
    #[inline]
    pub(crate) fn source(&self, patch: usize, tap: usize, len: usize) -> Option<usize> {
        (patch * self.stride + tap)
            .checked_sub(self.pad)
            .filter(|&index| index < len)
    }

    /// Rows of the column matrix for `channels` input channels.
    #[inline]
    pub(crate) fn col_rows(&self, channels: usize) -> usize {
        channels * self.filter_size * self.filter_size
    }
}

/// Convolution computed directly from its definition.
///
/// # Panics
/// Panics if the tensors are not `[ic, ih, iw]`, `[oc, ic, f, f]` and `[oc, oh, ow]` for this geometry.
pub fn convolution(
    input: TensorView<'_, f32>,
    filter: TensorView<'_, f32>,
    mut out: TensorViewMut<'_, f32>,
    geometry: ConvGeometry,
) {
    let [ic, ih, iw] = input.shape().to_array();
    let [oc, fc, fh, fw] = filter.shape().to_array();
    let [c, oh, ow] = out.shape().to_array();
    let f = geometry.filter_size;
    assert_eq!([fc, fh, fw], [ic, f, f], "filter {} mismatch", filter.shape());
    assert_eq!([c, oh, ow], [oc, geometry.output_dim(ih), geometry.output_dim(iw)]);

    for (d, ay, ax) in itertools::iproduct!(0..oc, 0..oh, 0..ow) {
        let mut sum = 0.0;
        for (fd, fy, fx) in itertools::iproduct!(0..ic, 0..f, 0..f) {
            let (Some(y), Some(x)) = (geometry.source(ay, fy, ih), geometry.source(ax, fx, iw))
            else {
                continue;
            };
            sum += input[[fd, y, x]] * filter[[d, fd, fy, fx]];
        }
        out[[d, ay, ax]] = sum;
    }
}

/// Transposed (fractionally strided) convolution computed directly from its definition.
///
/// Every input pixel `(iy, ix)` spreads `input · filter[.., .., fy, fx]` onto output pixel
/// `(iy · s + fy − p, ix · s + fx − p)`.
///
/// # Panics
/// Panics on over-full padding or if the tensors are not `[ic, ih, iw]`, `[ic, oc, f, f]` and
/// `[oc, oh, ow]` for this geometry.
pub fn transposed_convolution(
    input: TensorView<'_, f32>,
    filter: TensorView<'_, f32>,
    mut out: TensorViewMut<'_, f32>,
    geometry: ConvGeometry,
) {
    let [ic, ih, iw] = input.shape().to_array();
    let [fc, oc, fh, fw] = filter.shape().to_array();
    let [c, oh, ow] = out.shape().to_array();
    let f = geometry.filter_size;
    let s = geometry.stride;
    assert_eq!([fc, fh, fw], [ic, f, f], "filter {} mismatch", filter.shape());
    assert_eq!([c, oh, ow], [
        oc,
        geometry.transposed_output_dim(ih),
        geometry.transposed_output_dim(iw)
    ]);

    // position on the input grid feeding output `index` through tap `tap`
    let locate = |index: usize, tap: usize, len: usize| {
        (index + geometry.pad)
            .checked_sub(tap)
            .filter(|offset| offset % s == 0)
            .map(|offset| offset / s)
            .filter(|&index| index < len)
    };

    for (d, ay, ax) in itertools::iproduct!(0..oc, 0..oh, 0..ow) {
        let mut sum = 0.0;
        for (fd, fy, fx) in itertools::iproduct!(0..ic, 0..f, 0..f) {
            let (Some(y), Some(x)) = (locate(ay, fy, ih), locate(ax, fx, iw)) else {
                continue;
            };
            sum += input[[fd, y, x]] * filter[[fd, d, fy, fx]];
        }
        out[[d, ay, ax]] = sum;
    }
}

/// Unfolds every receptive field of `im` into a column of `col`.
///
/// `col` is shaped `[ic · f · f, oh · ow]`; row `(c · f + fy) · f + fx`, column `oy · ow + ox`.
/// Taps in the padding are zero.
pub fn im2col(im: TensorView<'_, f32>, geometry: ConvGeometry, col: &mut Tensor<f32>) {
    let [ic, ih, iw] = im.shape().to_array();
    let [oh, ow] = geometry.output_shape([ih, iw]);
    let f = geometry.filter_size;
    col.ensure_shape([geometry.col_rows(ic), oh * ow]);

    let im = im.as_slice();
    let data = col.as_mut_slice();
    for (row, (c, fy, fx)) in itertools::iproduct!(0..ic, 0..f, 0..f).enumerate() {
        let row = &mut data[row * oh * ow..(row + 1) * oh * ow];
        for (oy, ox) in itertools::iproduct!(0..oh, 0..ow) {
            row[oy * ow + ox] = match (geometry.source(oy, fy, ih), geometry.source(ox, fx, iw)) {
                (Some(y), Some(x)) => im[(c * ih + y) * iw + x],
                _ => 0.0,
            };
        }
    }
}

/// Folds a column matrix back into `im`, accumulating overlapping taps. Inverse layout of [`im2col`].
///
/// `im` is zeroed first. Each pixel receives its taps in ascending `(fy, fx)` order.
///
/// # Panics
/// Panics if `col` is not `[c · f · f, ph · pw]` for the patch grid of `im`.
pub fn col2im(col: TensorView<'_, f32>, geometry: ConvGeometry, mut im: TensorViewMut<'_, f32>) {
    let [channels, ih, iw] = im.shape().to_array();
    let [ph, pw] = geometry.output_shape([ih, iw]);
    let f = geometry.filter_size;
    assert_eq!(
        col.shape().to_array::<2>(),
        [geometry.col_rows(channels), ph * pw],
        "column matrix mismatch"
    );

    im.zero();
    let col = col.as_slice();
    let data = im.as_mut_slice();
    for (row, (c, fy, fx)) in itertools::iproduct!(0..channels, 0..f, 0..f).enumerate() {
        let row = &col[row * ph * pw..(row + 1) * ph * pw];
        for (py, px) in itertools::iproduct!(0..ph, 0..pw) {
            if let (Some(y), Some(x)) = (geometry.source(py, fy, ih), geometry.source(px, fx, iw)) {
                data[(c * ih + y) * iw + x] += row[py * pw + px];
            }
        }
    }
}

/// Convolution as im2col followed by one GEMM (`m = oc`, `n = oh · ow`, `k = ic · f²`).
///
/// ## Arguments
/// * `col` - Scratch buffer, reshaped as needed and reused across calls.
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn convolution_im2col(
    input: TensorView<'_, f32>,
    filter: TensorView<'_, f32>,
    mut out: TensorViewMut<'_, f32>,
    geometry: ConvGeometry,
    col: &mut Tensor<f32>,
) {
    let [ic, ih, iw] = input.shape().to_array();
    let [oc, fc, fh, fw] = filter.shape().to_array();
    let f = geometry.filter_size;
    assert_eq!([fc, fh, fw], [ic, f, f], "filter {} mismatch", filter.shape());
    let [oh, ow] = geometry.output_shape([ih, iw]);
    assert_eq!(out.shape().to_array::<3>(), [oc, oh, ow]);

    im2col(input, geometry, col);

    let [m, n, k] = [oc, oh * ow, geometry.col_rows(ic)];
    #[rustfmt::skip]
    sgemm(
        Transpose::No, Transpose::No, m, n, k,
        1.0, filter.as_slice(), k, col.as_slice(), n,
        0.0, out.as_mut_slice(), n,
    );
}

/// Transposed convolution as one GEMM against the transposed filter followed by [`col2im`].
///
/// The GEMM produces `col = filterᵀ · input` of shape `[oc · f², ih · iw]`.
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn transposed_convolution_im2col(
    input: TensorView<'_, f32>,
    filter: TensorView<'_, f32>,
    out: TensorViewMut<'_, f32>,
    geometry: ConvGeometry,
    col: &mut Tensor<f32>,
) {
    let [ic, ih, iw] = input.shape().to_array();
    let [fc, oc, fh, fw] = filter.shape().to_array();
    let f = geometry.filter_size;
    assert_eq!([fc, fh, fw], [ic, f, f], "filter {} mismatch", filter.shape());
    let [oh, ow] = geometry.transposed_output_shape([ih, iw]);
    assert_eq!(out.shape().to_array::<3>(), [oc, oh, ow]);

    let [m, n, k] = [geometry.col_rows(oc), ih * iw, ic];
    col.ensure_shape([m, n]);
    #[rustfmt::skip]
    sgemm(
        Transpose::Yes, Transpose::No, m, n, k,
        1.0, filter.as_slice(), m, input.as_slice(), n,
        0.0, col.as_mut_slice(), n,
    );

    col2im(col.view(), geometry, out);
}

/// Flat indices of all dirty (`> 0`) pixels of a mask, in row-major order.
#[inline]
pub(crate) fn dirty_pixels(mask: &[f32]) -> impl Iterator<Item = usize> + '_ {
    mask.iter().positions(|&x| x > 0.0)
}
