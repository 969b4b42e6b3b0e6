use super::{LayerError, Operator, Params, single};
use crate::{
    graph::node::{Bottom, Buffers, Pass},
    hal::{
        activation::Activation,
        blas::{Transpose, sgemv},
    },
    loom::tensor::Tensor,
};

/// Fully connected layer `z = W · x + b`, `y = σ(z)` over the flattened bottom.
///
/// The output is `[outputs, 1, 1]` and its mask a single pixel, dirty iff anything in the bottom is.
#[derive(Debug, Clone, masked_cnn_derive::Parametric)]
#[parametric(crate = "crate")]
pub struct FullyConnected {
    #[parametric]
    params: Params,
    z: Tensor<f32>,
    dy_dz: Tensor<f32>,
}

impl FullyConnected {
    /// ## Arguments
    /// * `weights` - Matrix `[outputs, inputs]`.
    /// * `biases` - One bias per output.
    pub fn new(
        weights: Tensor<f32>,
        biases: Tensor<f32>,
        activation: Activation,
    ) -> Result<Self, LayerError> {
        if weights.shape().len() != 2 {
            return Err(LayerError::Weights {
                expected: "a 2-d matrix",
                found: weights.shape().clone(),
            });
        }
        let [outputs, _] = weights.shape().to_array();
        let params = Params {
            weights,
            biases,
            activation,
        };
        params.check_biases(outputs)?;
        Ok(Self {
            params,
            z: Tensor::default(),
            dy_dz: Tensor::default(),
        })
    }

    #[inline]
    pub fn z(&self) -> &Tensor<f32> {
        &self.z
    }

    #[inline]
    pub fn dy_dz(&self) -> &Tensor<f32> {
        &self.dy_dz
    }
}

impl Operator for FullyConnected {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        let bottom = single(bottoms)?;
        let [outputs, inputs] = self.params.weights.shape().to_array();
        if bottom.iter().product::<usize>() != inputs {
            return Err(LayerError::Bottom(
                bottom,
                format!("weights expect {inputs} inputs"),
            ));
        }
        let shape = [outputs, 1, 1];
        self.z = Tensor::zeros(shape);
        self.dy_dz = Tensor::zeros(shape);
        Ok(shape)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "fully_connected", skip_all))]
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        let Bottom { output: input, mask } = bottoms[0];
        let dirty = mask.as_slice().iter().any(|&x| x > 0.0);
        buffers.mask.fill(if dirty { 1.0 } else { 0.0 });
        if pass == Pass::Masked && !dirty {
            return;
        }

        let Params {
            weights,
            biases,
            activation,
        } = &self.params;
        let [outputs, inputs] = weights.shape().to_array();
        let z = self.z.as_mut_slice();
        sgemv(
            Transpose::No,
            outputs,
            inputs,
            1.0,
            weights.as_slice(),
            inputs,
            input.as_slice(),
            0.0,
            z,
        );
        z.iter_mut()
            .zip(biases.as_slice())
            .for_each(|(z, &bias)| *z += bias);

        activation.apply(
            self.z.as_slice(),
            buffers.output.as_mut_slice(),
            self.dy_dz.as_mut_slice(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::FullyConnected;
    use crate::{
        graph::{
            layers::Operator,
            node::{Bottom, Buffers, Pass},
        },
        hal::activation::Activation,
        loom::tensor::Tensor,
    };

    #[test]
    fn test_fully_connected() -> Result<(), Box<dyn Error>> {
        let weights = Tensor::from_data([2, 4], vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, -1.0, 0.0])?;
        let biases = Tensor::from_data([2], vec![0.5, -0.5])?;
        let mut layer = FullyConnected::new(weights, biases, Activation::Identity)?;
        assert!(layer.infer(&[[1, 3, 1]]).is_err());
        let shape = layer.infer(&[[1, 2, 2]])?;
        assert_eq!(shape, [2, 1, 1]);

        let input = Tensor::from_data([1, 2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
        let all = Tensor::filled([2, 2], 1.0);
        let mut buffers = Buffers::new(shape);
        layer.forward(&[Bottom { output: &input, mask: &all }], &mut buffers, Pass::Dense);
        assert_eq!(buffers.output.as_slice(), &[5.5, -1.5]);
        assert_eq!(buffers.mask.as_slice(), &[1.0]);

        // a clean bottom leaves a masked layer untouched
        let input = Tensor::zeros([1, 2, 2]);
        let clean = Tensor::zeros([2, 2]);
        layer.forward(&[Bottom { output: &input, mask: &clean }], &mut buffers, Pass::Masked);
        assert_eq!(buffers.output.as_slice(), &[5.5, -1.5]);
        assert_eq!(buffers.mask.as_slice(), &[0.0]);
        Ok(())
    }
}
