//! Frame-level helpers around a graph: change detection and synthetic frame edits.

use itertools::{Itertools, iproduct};

use crate::loom::tensor::{Tensor, TensorError};

/// Turns consecutive frames `[C, H, W]` into change masks `[H, W]`.
///
/// A pixel's absolute differences, summed over channels, accumulate until they exceed the
/// threshold. The pixel is then reported dirty and its accumulator restarts, so slow drift is
/// eventually flagged instead of silently ignored.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    threshold: f32,
    previous: Option<Tensor<f32>>,
    accumulator: Vec<f32>,
}

impl ChangeDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            previous: None,
            accumulator: vec![],
        }
    }

    #[inline]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Forgets the previous frame. The next frame is reported entirely dirty.
    pub fn reset(&mut self) {
        self.previous = None;
        self.accumulator.clear();
    }

    /// Computes the mask of `frame` against the last frame seen and remembers `frame`.
    ///
    /// A frame whose shape differs from the previous one restarts detection.
    pub fn detect(&mut self, frame: &Tensor<f32>) -> Tensor<f32> {
        let [channels, rows, cols] = frame.shape().to_array();
        let size = rows * cols;

        let previous = match self.previous.take() {
            Some(previous) if previous.shape() == frame.shape() => previous,
            _ => {
                self.accumulator = vec![0.0; size];
                self.previous = Some(frame.clone());
                return Tensor::filled([rows, cols], 1.0);
            }
        };

        let mut mask = Tensor::zeros([rows, cols]);
        for (index, (acc, dirty)) in self
            .accumulator
            .iter_mut()
            .zip_eq(mask.as_mut_slice())
            .enumerate()
        {
            *acc += (0..channels)
                .map(|c| (frame[c * size + index] - previous[c * size + index]).abs())
                .sum::<f32>();
            if *acc > self.threshold {
                *acc = 0.0;
                *dirty = 1.0;
            }
        }

        self.previous = Some(frame.clone());
        mask
    }
}

/// Converts interleaved `[H, W, C]` bytes into a planar `[C, H, W]` float frame.
pub fn planar_from_interleaved(
    bytes: &[u8],
    height: usize,
    width: usize,
    channels: usize,
) -> Result<Tensor<f32>, TensorError> {
    let interleaved = Tensor::<u8>::from_data([height, width, channels], bytes)?;
    let mut frame = Tensor::zeros([channels, height, width]);
    for (c, y, x) in iproduct!(0..channels, 0..height, 0..width) {
        frame[[c, y, x]] = interleaved[[y, x, c]] as f32;
    }
    Ok(frame)
}

/// Toggles the top-left region covering `percent`% of the frame between 0 and 255.
///
/// Each side is scaled by the square root of the fraction, so the region stays square-ish.
pub fn change_percent_of_frame(frame: &mut Tensor<f32>, percent: u32) {
    let [channels, rows, cols] = frame.shape().to_array();
    let part = (percent.min(100) as f32 / 100.0).sqrt();
    let rows = (rows as f32 * part) as usize;
    let cols = (cols as f32 * part) as usize;

    for (c, y, x) in iproduct!(0..channels, 0..rows, 0..cols) {
        let value = &mut frame[[c, y, x]];
        *value = if *value == 0.0 { 255.0 } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{ChangeDetector, change_percent_of_frame, planar_from_interleaved};
    use crate::loom::tensor::Tensor;

    #[test]
    fn test_first_frame_is_dirty() {
        let mut detector = ChangeDetector::new(10.0);
        let mask = detector.detect(&Tensor::zeros([3, 2, 4]));
        assert_eq!(mask.shape().to_array::<2>(), [2, 4]);
        assert_eq!(mask.as_slice(), &[1.0; 8]);

        let mask = detector.detect(&Tensor::zeros([3, 2, 4]));
        assert_eq!(mask.as_slice(), &[0.0; 8]);

        detector.reset();
        let mask = detector.detect(&Tensor::zeros([3, 2, 4]));
        assert_eq!(mask.as_slice(), &[1.0; 8]);
    }

    #[test]
    fn test_threshold_sums_channels() {
        let mut detector = ChangeDetector::new(10.0);
        let mut frame = Tensor::zeros([3, 1, 2]);
        detector.detect(&frame);

        // 4 + 4 + 4 > 10 at pixel 0; 4 < 10 at pixel 1
        for c in 0..3 {
            frame[[c, 0, 0]] = 4.0;
        }
        frame[[0, 0, 1]] = 4.0;
        let mask = detector.detect(&frame);
        assert_eq!(mask.as_slice(), &[1.0, 0.0]);
    }

    #[test]
    fn test_slow_drift_accumulates() {
        let mut detector = ChangeDetector::new(10.0);
        let mut frame = Tensor::zeros([1, 1, 1]);
        detector.detect(&frame);

        let mut flagged = vec![];
        for step in 1..=6 {
            frame[0] = 4.0 * step as f32;
            flagged.push(detector.detect(&frame)[0]);
        }
        // accumulates 4, 8, 12 (flag, restart), 4, 8, 12 (flag)
        assert_eq!(flagged, [0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_shape_change_restarts() {
        let mut detector = ChangeDetector::new(1.0);
        detector.detect(&Tensor::zeros([1, 2, 2]));
        let mask = detector.detect(&Tensor::zeros([1, 3, 3]));
        assert_eq!(mask.as_slice(), &[1.0; 9]);
    }

    #[test]
    fn test_planar_from_interleaved() -> Result<(), Box<dyn Error>> {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let frame = planar_from_interleaved(&bytes, 2, 2, 3)?;
        assert_eq!(frame.shape().to_array::<3>(), [3, 2, 2]);
        assert_eq!(
            frame.as_slice(),
            &[1.0, 4.0, 7.0, 10.0, 2.0, 5.0, 8.0, 11.0, 3.0, 6.0, 9.0, 12.0]
        );
        assert!(planar_from_interleaved(&bytes, 2, 2, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_change_percent_of_frame() {
        let mut frame = Tensor::zeros([2, 10, 10]);
        frame[[1, 0, 0]] = 7.0;
        change_percent_of_frame(&mut frame, 25);

        assert_eq!(frame[[0, 0, 0]], 255.0);
        assert_eq!(frame[[0, 4, 4]], 255.0);
        assert_eq!(frame[[0, 5, 5]], 0.0);
        assert_eq!(frame[[1, 0, 0]], 0.0);
        let changed = frame.as_slice().iter().filter(|&&x| x > 0.0).count();
        assert_eq!(changed, 2 * 25 - 1);
    }
}
