use super::{LayerError, Operator, active_pixels, single};
use crate::graph::node::{Bottom, Buffers, Pass};

/// Dropout at inference time: scales the bottom by the keep probability `1 − rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Result<Self, LayerError> {
        match (0.0..1.0).contains(&rate) {
            true => Ok(Self { rate }),
            false => Err(LayerError::Parameter(format!(
                "dropout rate {rate} outside [0, 1)"
            ))),
        }
    }

    #[inline]
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Operator for Dropout {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        single(bottoms)
    }

    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        let Bottom { output: input, mask } = bottoms[0];
        buffers.mask.as_mut_slice().copy_from_slice(mask.as_slice());

        let scale = 1.0 - self.rate;
        let area = buffers.mask.len();
        let input = input.as_slice();
        let output = buffers.output.as_mut_slice();
        for pixel in active_pixels(&buffers.mask, pass) {
            for index in (pixel..output.len()).step_by(area) {
                output[index] = input[index] * scale;
            }
        }
    }
}

/// Softmax across channels, independently at every pixel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Softmax;

impl Operator for Softmax {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        single(bottoms)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "softmax", skip_all))]
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        let Bottom { output: input, mask } = bottoms[0];
        buffers.mask.as_mut_slice().copy_from_slice(mask.as_slice());

        let area = buffers.mask.len();
        let input = input.as_slice();
        let output = buffers.output.as_mut_slice();
        for pixel in active_pixels(&buffers.mask, pass) {
            let x = (pixel..input.len()).step_by(area).map(|index| input[index]);
            let max = x.clone().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = x.map(|x| (x - max).exp()).sum();
            for index in (pixel..output.len()).step_by(area) {
                output[index] = (input[index] - max).exp() / sum;
            }
        }
    }
}

/// Elementwise sum of bottoms of identical shape.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Eltwise;

impl Operator for Eltwise {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        let Some(&shape) = bottoms.first() else {
            return Err(LayerError::Parameter("eltwise needs bottoms".into()));
        };
        match bottoms.iter().find(|&&other| other != shape) {
            Some(&other) => Err(LayerError::Bottom(
                other,
                format!("differs from first bottom {shape:?}"),
            )),
            None => Ok(shape),
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "eltwise", skip_all))]
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        // union of the bottom masks
        for (index, dirty) in buffers.mask.as_mut_slice().iter_mut().enumerate() {
            let any = bottoms.iter().any(|bottom| bottom.mask[index] > 0.0);
            *dirty = if any { 1.0 } else { 0.0 };
        }

        let area = buffers.mask.len();
        let output = buffers.output.as_mut_slice();
        for pixel in active_pixels(&buffers.mask, pass) {
            for index in (pixel..output.len()).step_by(area) {
                output[index] = bottoms
                    .iter()
                    .fold(0.0, |sum, bottom| sum + bottom.output[index]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Dropout, Eltwise, Softmax};
    use crate::{
        graph::{
            layers::Operator,
            node::{Bottom, Buffers, Pass},
        },
        loom::tensor::Tensor,
    };

    macro_rules! assert_approx_eq {
        ($a:expr, $b:expr) => {
            assert!(($a - $b).abs() < 1e-6, "{} != {}", $a, $b)
        };
    }

    #[test]
    fn test_dropout() -> Result<(), Box<dyn Error>> {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());

        let mut dropout = Dropout::new(0.25)?;
        let shape = dropout.infer(&[[2, 1, 2]])?;
        let input = Tensor::from_data(shape, vec![4.0, 8.0, -4.0, 2.0])?;
        let mut mask = Tensor::zeros([1, 2]);
        mask[[0, 1]] = 1.0;

        let mut buffers = Buffers::new(shape);
        buffers.output.fill(7.0);
        let bottom = Bottom {
            output: &input,
            mask: &mask,
        };
        dropout.forward(&[bottom], &mut buffers, Pass::Masked);
        assert_eq!(buffers.output.as_slice(), &[7.0, 6.0, 7.0, 1.5]);
        assert_eq!(buffers.mask, mask);

        dropout.forward(&[bottom], &mut buffers, Pass::Dense);
        assert_eq!(buffers.output.as_slice(), &[3.0, 6.0, -3.0, 1.5]);
        Ok(())
    }

    #[test]
    fn test_softmax() -> Result<(), Box<dyn Error>> {
        let mut softmax = Softmax;
        let shape = softmax.infer(&[[3, 1, 2]])?;
        let input = Tensor::from_data(shape, vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0])?;
        let mask = Tensor::filled([1, 2], 1.0);
        let mut buffers = Buffers::new(shape);
        let bottom = Bottom {
            output: &input,
            mask: &mask,
        };
        softmax.forward(&[bottom], &mut buffers, Pass::Dense);

        let sum = 1f32.exp() + 2f32.exp() + 3f32.exp();
        assert_approx_eq!(buffers.output[[0, 0, 0]], 1f32.exp() / sum);
        assert_approx_eq!(buffers.output[[2, 0, 0]], 3f32.exp() / sum);
        assert_approx_eq!(buffers.output[[1, 0, 1]], 1.0 / 3.0);
        let total: f32 = (0..3).map(|c| buffers.output[[c, 0, 0]]).sum();
        assert_approx_eq!(total, 1.0);
        Ok(())
    }

    #[test]
    fn test_eltwise() -> Result<(), Box<dyn Error>> {
        let mut eltwise = Eltwise;
        assert!(eltwise.infer(&[[1, 2, 2], [1, 2, 3]]).is_err());
        let shape = eltwise.infer(&[[1, 1, 3], [1, 1, 3]])?;

        let a = Tensor::from_data(shape, vec![1.0, 2.0, 3.0])?;
        let b = Tensor::from_data(shape, vec![10.0, 20.0, 30.0])?;
        let mask_a = Tensor::from_data([1, 3], vec![1.0, 0.0, 0.0])?;
        let mask_b = Tensor::from_data([1, 3], vec![0.0, 0.0, 2.0])?;
        let mut buffers = Buffers::new(shape);
        let bottoms = [
            Bottom {
                output: &a,
                mask: &mask_a,
            },
            Bottom {
                output: &b,
                mask: &mask_b,
            },
        ];
        eltwise.forward(&bottoms, &mut buffers, Pass::Masked);
        assert_eq!(buffers.mask.as_slice(), &[1.0, 0.0, 1.0]);
        assert_eq!(buffers.output.as_slice(), &[11.0, 0.0, 33.0]);
        Ok(())
    }
}
