//! Dirty-only convolution kernels and change-mask propagation.
//!
//! A change mask is a `[rows, cols]` tensor over a layer's output; elements `> 0` are dirty.
//! Masked kernels compute exactly the dense result at dirty pixels and never touch clean ones.
//!
//! Packed buffers hold one column per dirty pixel, in row-major pixel order, with the number of
//! dirty pixels as leading dimension.

use super::{
    blas::{Transpose, sgemm},
    conv::{ConvGeometry, col2im, dirty_pixels, im2col},
};
use crate::loom::tensor::{Tensor, TensorView, TensorViewMut};

/// Scratch buffers of a masked layer, sized for the worst case once and reused every frame.
#[derive(Debug, Default, Clone)]
pub struct Workspace {
    /// Column matrix of the main GEMM.
    pub col: Tensor<f32>,
    /// Packed GEMM result of a forward convolution, or packed input of a transposed one.
    pub buffer: Tensor<f32>,
    /// Input-space mask of a transposed convolution.
    pub support: Tensor<f32>,
    /// Column matrix of the mask propagation.
    pub mask_col: Tensor<f32>,
    /// Row-major indices of the supported input pixels of a transposed convolution.
    pub pixels: Vec<usize>,
}

/// Derives the output mask of a convolution from the mask of its input.
///
/// Convolves `prev_mask` with an all-ones `f × f` kernel of the same geometry, i.e. sums every
/// column of its im2col matrix. An output pixel is dirty iff any pixel of its receptive field is
/// dirty, so no changed pixel is ever missed.
///
/// # Panics
/// Panics if `mask` is not the output extent of `prev_mask` under this geometry.
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn convolve_mask_im2col(
    prev_mask: TensorView<'_, f32>,
    mut mask: TensorViewMut<'_, f32>,
    col: &mut Tensor<f32>,
    geometry: ConvGeometry,
) {
    let [ih, iw] = prev_mask.shape().to_array();
    let [oh, ow] = mask.shape().to_array();
    assert_eq!([oh, ow], geometry.output_shape([ih, iw]), "mask extent mismatch");

    let prev_mask = prev_mask.reshape([1, ih, iw]).expect("same element count");
    im2col(prev_mask, geometry, col);

    let mask = mask.as_mut_slice();
    mask.fill(0.0);
    for row in col.as_slice().chunks_exact(oh * ow) {
        mask.iter_mut().zip(row).for_each(|(sum, &x)| *sum += x);
    }
}

/// Derives the output mask of a transposed convolution from the mask of its input.
///
/// Every dirty input pixel marks its whole `f × f` footprint on the output dirty.
///
/// # Panics
/// Panics if `mask` is not the transposed output extent of `prev_mask` under this geometry.
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn deconvolve_mask_col2im(
    prev_mask: TensorView<'_, f32>,
    mask: TensorViewMut<'_, f32>,
    col: &mut Tensor<f32>,
    geometry: ConvGeometry,
) {
    let [ih, iw] = prev_mask.shape().to_array();
    let [oh, ow] = mask.shape().to_array();
    assert_eq!(
        [oh, ow],
        geometry.transposed_output_shape([ih, iw]),
        "mask extent mismatch"
    );

    let n = ih * iw;
    col.ensure_shape([geometry.col_rows(1), n]);
    let prev_mask = prev_mask.as_slice();
    for row in col.as_mut_slice().chunks_exact_mut(n) {
        row.iter_mut()
            .zip(prev_mask)
            .for_each(|(x, &dirty)| *x = if dirty > 0.0 { 1.0 } else { 0.0 });
    }

    let mask = mask.reshape([1, oh, ow]).expect("same element count");
    col2im(col.view(), geometry, mask);
}

/// Unfolds only the receptive fields of dirty output pixels.
///
/// The packed matrix `[ic · f · f, dirty]` is written to the front of `col`, which must already
/// hold at least that many elements. Returns the number of dirty pixels.
///
/// # Panics
/// Panics if `mask` is not the output extent of `im`, or if `col` is too small.
pub fn im2col_masked(
    im: TensorView<'_, f32>,
    mask: TensorView<'_, f32>,
    geometry: ConvGeometry,
    col: &mut Tensor<f32>,
) -> usize {
    let [ic, ih, iw] = im.shape().to_array();
    let [oh, ow] = mask.shape().to_array();
    assert_eq!([oh, ow], geometry.output_shape([ih, iw]), "mask extent mismatch");

    let f = geometry.filter_size;
    let patches = dirty_pixels(mask.as_slice()).count();
    assert!(
        col.len() >= geometry.col_rows(ic) * patches,
        "column buffer of {} too small for {patches} patches",
        col.len()
    );
    if patches == 0 {
        return 0;
    }

    let im = im.as_slice();
    let data = col.as_mut_slice();
    for (patch, pixel) in dirty_pixels(mask.as_slice()).enumerate() {
        let (oy, ox) = (pixel / ow, pixel % ow);
        for (row, (c, fy, fx)) in itertools::iproduct!(0..ic, 0..f, 0..f).enumerate() {
            data[row * patches + patch] =
                match (geometry.source(oy, fy, ih), geometry.source(ox, fx, iw)) {
                    (Some(y), Some(x)) => im[(c * ih + y) * iw + x],
                    _ => 0.0,
                };
        }
    }
    patches
}

/// Convolution restricted to the dirty pixels of `mask`.
///
/// The packed result `[oc, dirty]` lands in the front of `buffer`; scatter it back with
/// [`place_buffer_back`]. Returns the number of dirty pixels.
///
/// ## Arguments
/// * `mask` - Output-space mask `[oh, ow]`.
/// * `col` - Scratch column matrix, resized to the worst case `[ic · f², oh · ow]` on first use.
/// * `buffer` - Packed output, resized to the worst case `[oc, oh · ow]` on first use.
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn convolution_im2col_masked(
    input: TensorView<'_, f32>,
    mask: TensorView<'_, f32>,
    filter: TensorView<'_, f32>,
    geometry: ConvGeometry,
    col: &mut Tensor<f32>,
    buffer: &mut Tensor<f32>,
) -> usize {
    let [ic, ih, iw] = input.shape().to_array();
    let [oc, fc, fh, fw] = filter.shape().to_array();
    let f = geometry.filter_size;
    assert_eq!([fc, fh, fw], [ic, f, f], "filter {} mismatch", filter.shape());
    let [oh, ow] = geometry.output_shape([ih, iw]);

    col.ensure_shape([geometry.col_rows(ic), oh * ow]);
    buffer.ensure_shape([oc, oh * ow]);

    let patches = im2col_masked(input, mask, geometry, col);

    let [m, n, k] = [oc, patches, geometry.col_rows(ic)];
    #[rustfmt::skip]
    sgemm(
        Transpose::No, Transpose::No, m, n, k,
        1.0, filter.as_slice(), k, col.as_slice(), n,
        0.0, buffer.as_mut_slice(), n,
    );
    patches
}

/// Scatters a packed `[channels, dirty]` buffer into `out` at the dirty pixels of `mask`.
///
/// Pixels are visited in the same row-major order the packed columns were produced in. When given,
/// `bias[c]` is added to every value of channel `c`. Clean pixels keep their previous value.
///
/// # Panics
/// Panics if `out` is not `[channels, rows, cols]` over the mask, or the buffer is too small.
pub fn place_buffer_back(
    mask: TensorView<'_, f32>,
    buffer: &[f32],
    mut out: TensorViewMut<'_, f32>,
    bias: Option<&[f32]>,
) {
    let [channels, oh, ow] = out.shape().to_array();
    assert_eq!(mask.shape().to_array::<2>(), [oh, ow], "mask extent mismatch");
    if let Some(bias) = bias {
        assert_eq!(bias.len(), channels, "bias length mismatch");
    }

    let patches = dirty_pixels(mask.as_slice()).count();
    assert!(buffer.len() >= channels * patches, "packed buffer too small");

    let data = out.as_mut_slice();
    for (patch, pixel) in dirty_pixels(mask.as_slice()).enumerate() {
        for c in 0..channels {
            let value = buffer[c * patches + patch];
            data[c * oh * ow + pixel] = match bias {
                Some(bias) => value + bias[c],
                None => value,
            };
        }
    }
}

/// Transposed convolution restricted to the inputs that feed a dirty output pixel.
///
/// 1. The support (the input pixels whose footprint touches a dirty output pixel) is derived from
///    `mask` with [`convolve_mask_im2col`] and stored in `workspace.support`, its row-major indices
///    in `workspace.pixels`.
/// 2. Supported input columns are packed into `workspace.buffer` as `[ic, n]`.
/// 3. One GEMM produces the packed column matrix `[oc · f², n]` in `workspace.col`.
///
/// Fold the result back with [`col2im_masked`]. Returns `n`, the number of supported input pixels.
///
/// ## Arguments
/// * `mask` - Output-space mask `[oh, ow]`, typically from [`deconvolve_mask_col2im`].
#[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all))]
pub fn transposed_convolution_im2col_masked(
    input: TensorView<'_, f32>,
    mask: TensorView<'_, f32>,
    filter: TensorView<'_, f32>,
    geometry: ConvGeometry,
    workspace: &mut Workspace,
) -> usize {
    let [ic, ih, iw] = input.shape().to_array();
    let [fc, oc, fh, fw] = filter.shape().to_array();
    let f = geometry.filter_size;
    assert_eq!([fc, fh, fw], [ic, f, f], "filter {} mismatch", filter.shape());
    let [oh, ow] = geometry.transposed_output_shape([ih, iw]);
    assert_eq!(mask.shape().to_array::<2>(), [oh, ow], "mask extent mismatch");

    let Workspace {
        col,
        buffer,
        support,
        mask_col,
        pixels,
    } = workspace;
    support.ensure_shape([ih, iw]);
    convolve_mask_im2col(mask, support.view_mut(), mask_col, geometry);

    pixels.clear();
    pixels.extend(dirty_pixels(support.as_slice()));
    let n = pixels.len();
    buffer.ensure_shape([ic, ih * iw]);
    col.ensure_shape([geometry.col_rows(oc), ih * iw]);
    if n == 0 {
        return 0;
    }

    let input = input.as_slice();
    for (c, packed) in buffer.as_mut_slice().chunks_exact_mut(n).take(ic).enumerate() {
        let channel = &input[c * ih * iw..(c + 1) * ih * iw];
        for (x, &pixel) in packed.iter_mut().zip(pixels.iter()) {
            *x = channel[pixel];
        }
    }

    let [m, k] = [geometry.col_rows(oc), ic];
    #[rustfmt::skip]
    sgemm(
        Transpose::Yes, Transpose::No, m, n, k,
        1.0, filter.as_slice(), m, buffer.as_slice(), n,
        0.0, col.as_mut_slice(), n,
    );
    n
}

/// Folds a packed column matrix into the dirty pixels of `im`, leaving clean pixels untouched.
///
/// Dirty pixels are zeroed and then accumulate their taps in the same order as [`col2im`], so
/// they end up bit-identical to a dense fold.
///
/// ## Arguments
/// * `col` - Packed column matrix `[c · f², n]` stored in the front of the slice.
/// * `pixels` - Row-major indices of the `n` packed columns on the input grid, ascending, as left
///   in [`Workspace::pixels`].
/// * `mask` - Output-space mask `[oh, ow]` selecting the pixels to write.
pub fn col2im_masked(
    col: &[f32],
    pixels: &[usize],
    mask: TensorView<'_, f32>,
    geometry: ConvGeometry,
    mut im: TensorViewMut<'_, f32>,
) {
    let [channels, oh, ow] = im.shape().to_array();
    let [ph, pw] = geometry.output_shape([oh, ow]);
    assert_eq!(mask.shape().to_array::<2>(), [oh, ow], "mask extent mismatch");
    assert!(
        pixels.last().is_none_or(|&pixel| pixel < ph * pw),
        "pixel outside of the input grid"
    );

    let f = geometry.filter_size;
    let mask = mask.as_slice();
    let n = pixels.len();
    assert!(col.len() >= geometry.col_rows(channels) * n, "packed columns too small");

    let data = im.as_mut_slice();
    for (x, &dirty) in data
        .chunks_exact_mut(oh * ow)
        .flat_map(|channel| channel.iter_mut().zip(mask))
    {
        if dirty > 0.0 {
            *x = 0.0;
        }
    }
    if n == 0 {
        return;
    }

    for (row, (c, fy, fx)) in itertools::iproduct!(0..channels, 0..f, 0..f).enumerate() {
        let packed = &col[row * n..(row + 1) * n];
        let channel = &mut data[c * oh * ow..(c + 1) * oh * ow];
        for (&pixel, &value) in pixels.iter().zip(packed) {
            let (py, px) = (pixel / pw, pixel % pw);
            let (Some(y), Some(x)) = (geometry.source(py, fy, oh), geometry.source(px, fx, ow))
            else {
                continue;
            };
            if mask[y * ow + x] > 0.0 {
                channel[y * ow + x] += value;
            }
        }
    }
}
