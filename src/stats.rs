//! Evaluation helpers over network outputs and masks.

use itertools::{Itertools, iproduct};

use crate::loom::tensor::Tensor;

/// Per-pixel index of the largest channel of an output `[C, H, W]`. Ties go to the lower channel.
pub fn argmax_channels(output: &Tensor<f32>) -> Tensor<u32> {
    let [channels, rows, cols] = output.shape().to_array();
    let mut labels = Tensor::zeros([rows, cols]);
    for (y, x) in iproduct!(0..rows, 0..cols) {
        let (label, _) = (0..channels)
            .map(|c| output[[c, y, x]])
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(label, max), (c, value)| {
                match value > max {
                    true => (c, value),
                    false => (label, max),
                }
            });
        labels[[y, x]] = label as u32;
    }
    labels
}

/// Mean intersection over union of `(prediction, truth)` label maps.
///
/// Classes that occur in neither map are left out of the mean. Returns `None` if no class occurs.
///
/// # Panics
/// Panics if a pair has mismatching shapes or holds a label `>= num_classes`.
pub fn mean_iou<'a>(
    pairs: impl IntoIterator<Item = (&'a Tensor<u32>, &'a Tensor<u32>)>,
    num_classes: usize,
) -> Option<f64> {
    let mut intersection = vec![0usize; num_classes];
    let mut union = vec![0usize; num_classes];

    for (prediction, truth) in pairs {
        assert_eq!(prediction.shape(), truth.shape(), "label map shapes differ");
        for (&p, &t) in prediction.as_slice().iter().zip_eq(truth.as_slice()) {
            let (p, t) = (p as usize, t as usize);
            assert!(p < num_classes && t < num_classes, "label out of range");
            union[t] += 1;
            match p == t {
                true => intersection[t] += 1,
                false => union[p] += 1,
            }
        }
    }

    let ious = intersection
        .into_iter()
        .zip_eq(union)
        .filter(|&(_, union)| union > 0)
        .map(|(intersection, union)| intersection as f64 / union as f64)
        .collect_vec();
    match ious.len() {
        0 => None,
        len => Some(ious.into_iter().sum::<f64>() / len as f64),
    }
}

/// Fraction of dirty pixels in a mask.
pub fn mask_density(mask: &Tensor<f32>) -> f32 {
    match mask.len() {
        0 => 0.0,
        len => mask.as_slice().iter().filter(|&&x| x > 0.0).count() as f32 / len as f32,
    }
}
