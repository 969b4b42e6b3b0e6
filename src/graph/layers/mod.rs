use std::ops::RangeInclusive;

use derive_more::Display;
use itertools::Either;
use thiserror::Error;

pub use self::{
    conv::{Convolution, Deconvolution},
    dense::FullyConnected,
    input::Input,
    pointwise::{Dropout, Eltwise, Softmax},
    pool::Pool,
};
use super::node::{Bottom, Buffers, Pass};
use crate::{
    hal::{activation::Activation, conv::dirty_pixels},
    loom::{shape::Shape, tensor::Tensor},
};

mod conv;
mod dense;
mod input;
mod pointwise;
mod pool;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("weights of shape {found} are not {expected}")]
    Weights { expected: &'static str, found: Shape },
    #[error("expected {expected} biases, found {found}")]
    Biases { expected: usize, found: usize },
    #[error("invalid parameter: {0}")]
    Parameter(String),
    #[error("incompatible bottom of shape {0:?}: {1}")]
    Bottom([usize; 3], String),
}

/// A layer holding learned parameters.
///
/// Can be derived with `#[derive(Parametric)]` on a struct that forwards to one marked field.
pub trait Parametric {
    fn weights(&self) -> &Tensor<f32>;
    fn biases(&self) -> &Tensor<f32>;
    fn activation(&self) -> Activation;

    /// Total number of learned scalars.
    fn parameter_count(&self) -> usize {
        self.weights().len() + self.biases().len()
    }
}

/// Materialized weights, biases and the non-linearity applied after them.
#[derive(Debug, Clone)]
pub struct Params {
    pub weights: Tensor<f32>,
    pub biases: Tensor<f32>,
    pub activation: Activation,
}

impl Parametric for Params {
    #[inline]
    fn weights(&self) -> &Tensor<f32> {
        &self.weights
    }

    #[inline]
    fn biases(&self) -> &Tensor<f32> {
        &self.biases
    }

    #[inline]
    fn activation(&self) -> Activation {
        self.activation
    }
}

impl Params {
    /// Checks that there is one bias per output.
    fn check_biases(&self, outputs: usize) -> Result<(), LayerError> {
        match self.biases.len() {
            found if found == outputs => Ok(()),
            found => Err(LayerError::Biases {
                expected: outputs,
                found,
            }),
        }
    }
}

/// Shape inference and computation of a single layer kind.
pub trait Operator {
    /// Infers the output shape `[C, H, W]` from the bottoms' and allocates internal state.
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError>;

    /// Computes the node's mask and output from its bottoms.
    ///
    /// The output mask is always derived. Under [`Pass::Masked`] only dirty pixels of `buffers.output`
    /// are written; clean ones keep the value from the previous frame.
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass);
}

#[derive(Debug, Clone, Display)]
pub enum Layer {
    #[display("input")]
    Input(Input),
    #[display("convolution")]
    Convolution(Convolution),
    #[display("deconvolution")]
    Deconvolution(Deconvolution),
    #[display("pool")]
    Pool(Pool),
    #[display("fully connected")]
    FullyConnected(FullyConnected),
    #[display("dropout")]
    Dropout(Dropout),
    #[display("softmax")]
    Softmax(Softmax),
    #[display("eltwise")]
    Eltwise(Eltwise),
    /// Splits a node into several consumers without copying.
    #[display("pass through")]
    PassThrough,
}

impl Layer {
    /// The layer's learned parameters, if it has any.
    pub fn parameters(&self) -> Option<&dyn Parametric> {
        match self {
            Layer::Convolution(layer) => Some(layer),
            Layer::Deconvolution(layer) => Some(layer),
            Layer::FullyConnected(layer) => Some(layer),
            _ => None,
        }
    }

    fn operator(&mut self) -> Option<&mut dyn Operator> {
        match self {
            Layer::Input(layer) => Some(layer),
            Layer::Convolution(layer) => Some(layer),
            Layer::Deconvolution(layer) => Some(layer),
            Layer::Pool(layer) => Some(layer),
            Layer::FullyConnected(layer) => Some(layer),
            Layer::Dropout(layer) => Some(layer),
            Layer::Softmax(layer) => Some(layer),
            Layer::Eltwise(layer) => Some(layer),
            Layer::PassThrough => None,
        }
    }

    /// Number of bottoms the layer accepts.
    pub fn arity(&self) -> RangeInclusive<usize> {
        match self {
            Layer::Input(_) => 0..=0,
            Layer::Eltwise(_) => 1..=usize::MAX,
            _ => 1..=1,
        }
    }

    pub(crate) fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        match self.operator() {
            Some(op) => op.infer(bottoms),
            None => Ok(bottoms[0]),
        }
    }

    pub(crate) fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        if let Some(op) = self.operator() {
            op.forward(bottoms, buffers, pass)
        }
    }
}

/// Flat spatial indices a pass has to recompute.
fn active_pixels(mask: &Tensor<f32>, pass: Pass) -> impl Iterator<Item = usize> + '_ {
    match pass {
        Pass::Masked => Either::Left(dirty_pixels(mask.as_slice())),
        Pass::Dense | Pass::Priming => Either::Right(0..mask.len()),
    }
}

/// Checks that a layer has exactly one bottom and returns its shape.
fn single(bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
    match bottoms {
        [shape] => Ok(*shape),
        _ => Err(LayerError::Parameter(format!(
            "expected a single bottom, found {}",
            bottoms.len()
        ))),
    }
}
