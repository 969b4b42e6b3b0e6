//! The layer graph: an arena of nodes, each holding its persistent output, delta and change mask.
//!
//! Graphs are built in two phases. [`GraphBuilder::add`] registers layers in topological order,
//! resolving bottoms by name; [`GraphBuilder::build`] infers every output shape from the input
//! shape and allocates all buffers. Every [`Graph::forward`] afterwards reuses them.

use std::ops::RangeInclusive;

use derive_more::{Display, From, Into};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

pub use self::{
    layers::{Layer, LayerError, Operator, Parametric, Params},
    node::{Bottom, Buffers, Node, Pass},
};
use crate::loom::{
    shape::IntoShape,
    tensor::{Tensor, TensorError},
};

pub mod layers;
pub mod node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into)]
#[display("#{_0}")]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node name {0} is already taken")]
    DuplicateName(String),
    #[error("node {node} references unknown bottom {bottom}")]
    UnknownBottom { node: String, bottom: String },
    #[error("node {node} ({kind}) takes {expected:?} bottoms, found {found}")]
    BottomCount {
        node: String,
        kind: String,
        expected: RangeInclusive<usize>,
        found: usize,
    },
    #[error("graph has no input node")]
    MissingInput,
    #[error("graph already has input node {0}")]
    DuplicateInput(String),
    #[error("node {node}: {source}")]
    Layer { node: String, source: LayerError },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Follows pass-through nodes to the node owning the buffers.
fn resolve(nodes: &[Node], mut id: NodeId) -> NodeId {
    while let Layer::PassThrough = nodes[id.0].layer {
        id = nodes[id.0].bottoms[0];
    }
    id
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
    input: Option<NodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a layer. Bottoms must name nodes added before.
    ///
    /// ## Arguments
    /// * `name` - Unique node name.
    /// * `layer` - Layer kind with its materialized parameters.
    /// * `bottoms` - Names of the nodes feeding this one, in order.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        layer: Layer,
        bottoms: &[&str],
    ) -> Result<NodeId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateName(name));
        }

        let expected = layer.arity();
        if !expected.contains(&bottoms.len()) {
            return Err(GraphError::BottomCount {
                node: name,
                kind: layer.to_string(),
                expected,
                found: bottoms.len(),
            });
        }

        let bottoms: Vec<NodeId> = bottoms
            .iter()
            .map(|&bottom| match self.names.get(bottom) {
                Some(&id) => Ok(id),
                None => Err(GraphError::UnknownBottom {
                    node: name.clone(),
                    bottom: bottom.to_string(),
                }),
            })
            .try_collect()?;

        let id = NodeId(self.nodes.len());
        if let Layer::Input(_) = layer {
            match self.input {
                Some(input) => {
                    let input = self.nodes[input.0].name.clone();
                    return Err(GraphError::DuplicateInput(input));
                }
                None => self.input = Some(id),
            }
        }

        self.names.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            layer,
            bottoms,
            buffers: Buffers::default(),
            shape: [0; 3],
            mask_enabled: false,
            primed: false,
        });
        Ok(id)
    }

    /// Infers all shapes from the input frame shape `[C, H, W]` and allocates every buffer.
    pub fn build(mut self, shape: [usize; 3]) -> Result<Graph, GraphError> {
        let input = self.input.ok_or(GraphError::MissingInput)?;

        for index in 0..self.nodes.len() {
            let bottoms = self.nodes[index]
                .bottoms
                .iter()
                .map(|id| self.nodes[id.0].shape)
                .collect_vec();

            let node = &mut self.nodes[index];
            if let Layer::Input(layer) = &mut node.layer {
                layer.bind(shape);
            }
            node.shape = node
                .layer
                .infer(&bottoms)
                .map_err(|source| GraphError::Layer {
                    node: node.name.clone(),
                    source,
                })?;
            if !matches!(node.layer, Layer::PassThrough) {
                node.buffers = Buffers::new(node.shape);
            }

            log::debug!(
                "{} {} ({}): {:?} -> {:?}",
                NodeId(index),
                node.name,
                node.layer,
                bottoms,
                node.shape
            );
        }

        let graph = Graph {
            nodes: self.nodes,
            names: self.names,
            input,
        };
        log::debug!(
            "built graph of {} nodes with {} parameters",
            graph.len(),
            graph.parameter_count()
        );
        Ok(graph)
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
    input: NodeId,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in topological order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// # Panics
    /// Panics if `id` does not belong to this graph.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    #[inline]
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    #[inline]
    pub fn input(&self) -> NodeId {
        self.input
    }

    #[inline]
    pub fn output(&self, id: NodeId) -> &Tensor<f32> {
        &self.nodes[resolve(&self.nodes, id).0].buffers.output
    }

    #[inline]
    pub fn delta(&self, id: NodeId) -> &Tensor<f32> {
        &self.nodes[resolve(&self.nodes, id).0].buffers.delta
    }

    #[inline]
    pub fn mask(&self, id: NodeId) -> &Tensor<f32> {
        &self.nodes[resolve(&self.nodes, id).0].buffers.mask
    }

    /// Number of dirty pixels in a node's mask after the last forward pass.
    #[inline]
    pub fn dirty_count(&self, id: NodeId) -> usize {
        self.nodes[resolve(&self.nodes, id).0].buffers.dirty_count()
    }

    pub fn parameter_count(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|node| node.layer.parameters())
            .map(|params| params.parameter_count())
            .sum()
    }

    /// Toggles masking on one node. The next forward pass after enabling primes the node.
    pub fn set_mask_enabled(&mut self, id: NodeId, enabled: bool) {
        self.nodes[id.0].set_mask_enabled(enabled);
    }

    /// Toggles masking on every node.
    pub fn set_masks_enabled(&mut self, enabled: bool) {
        self.nodes
            .iter_mut()
            .for_each(|node| node.set_mask_enabled(enabled));
    }

    /// Copies the next frame `[C, H, W]` into the input node.
    pub fn set_input(&mut self, frame: &Tensor<f32>) -> Result<(), GraphError> {
        let node = &mut self.nodes[self.input.0];
        frame.check_shape(&node.shape.into_shape())?;
        node.buffers
            .output
            .as_mut_slice()
            .copy_from_slice(frame.as_slice());
        Ok(())
    }

    /// Injects the change mask `[H, W]` of the next frame at the input node.
    ///
    /// Without an injected mask the input is treated as entirely dirty.
    pub fn set_input_mask(&mut self, mask: &Tensor<f32>) -> Result<(), GraphError> {
        let node = &mut self.nodes[self.input.0];
        let [_, rows, cols] = node.shape;
        mask.check_shape(&[rows, cols].into_shape())?;
        if node.pass() == Pass::Priming {
            log::warn!("input {} is priming, injected mask is ignored", node.name);
        }

        node.buffers
            .mask
            .as_mut_slice()
            .copy_from_slice(mask.as_slice());
        if let Layer::Input(layer) = &mut node.layer {
            layer.inject();
        }
        Ok(())
    }

    /// Runs every node once, in topological order.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn forward(&mut self) {
        for index in 0..self.nodes.len() {
            let (done, rest) = self.nodes.split_at_mut(index);
            let node = &mut rest[0];
            let bottoms = node
                .bottoms
                .iter()
                .map(|&id| {
                    let bottom = &done[resolve(done, id).0];
                    Bottom {
                        output: &bottom.buffers.output,
                        mask: &bottom.buffers.mask,
                    }
                })
                .collect_vec();
            node.forward(&bottoms);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Graph, GraphBuilder, GraphError, Layer, Pass};
    use crate::{
        graph::layers::{Convolution, Dropout, Eltwise, FullyConnected, Input, Pool, Softmax},
        hal::activation::Activation,
        loom::tensor::Tensor,
    };

    fn ones_conv(channels: usize, filter: usize, pad: usize) -> Layer {
        let weights = Tensor::filled([channels, channels, filter, filter], 1.0);
        let biases = Tensor::zeros([channels]);
        let layer = Convolution::new(weights, biases, 1, pad, Activation::Identity)
            .expect("valid convolution");
        Layer::Convolution(layer)
    }

    #[test]
    fn test_build_errors() -> Result<(), Box<dyn Error>> {
        let mut builder = GraphBuilder::new();
        builder.add("data", Layer::Input(Input::default()), &[])?;
        assert!(matches!(
            builder.add("data", Layer::Softmax(Softmax), &["data"]),
            Err(GraphError::DuplicateName(_))
        ));
        assert!(matches!(
            builder.add("prob", Layer::Softmax(Softmax), &["missing"]),
            Err(GraphError::UnknownBottom { .. })
        ));
        assert!(matches!(
            builder.add("prob", Layer::Softmax(Softmax), &[]),
            Err(GraphError::BottomCount { found: 0, .. })
        ));
        assert!(matches!(
            builder.add("again", Layer::Input(Input::default()), &[]),
            Err(GraphError::DuplicateInput(_))
        ));

        builder.add("conv", ones_conv(1, 5, 0), &["data"])?;
        assert!(matches!(
            builder.build([1, 3, 3]),
            Err(GraphError::Layer { .. })
        ));

        let mut builder = Graph::builder();
        assert!(builder.add("sum", Layer::Eltwise(Eltwise), &[]).is_err());
        assert!(matches!(
            builder.build([1, 3, 3]),
            Err(GraphError::MissingInput)
        ));
        Ok(())
    }

    #[test]
    fn test_shape_inference() -> Result<(), Box<dyn Error>> {
        let mut builder = Graph::builder();
        builder.add("data", Layer::Input(Input::default()), &[])?;
        builder.add("conv", ones_conv(2, 3, 1), &["data"])?;
        builder.add("split", Layer::PassThrough, &["conv"])?;
        builder.add("pool", Layer::Pool(Pool::new(2)?), &["split"])?;
        builder.add("drop", Layer::Dropout(Dropout::new(0.5)?), &["pool"])?;
        let weights = Tensor::zeros([3, 2 * 4 * 4]);
        let fc = FullyConnected::new(weights, Tensor::zeros([3]), Activation::Identity)?;
        builder.add("fc", Layer::FullyConnected(fc), &["drop"])?;
        let graph = builder.build([2, 8, 9])?;

        let shape = |name: &str| graph.find(name).map(|id| graph.node(id).shape());
        assert_eq!(shape("conv"), Some([2, 8, 9]));
        assert_eq!(shape("pool"), Some([2, 4, 4]));
        assert_eq!(shape("fc"), Some([3, 1, 1]));
        assert_eq!(shape("nothing"), None);
        assert_eq!(graph.parameter_count(), 2 * 2 * 9 + 2 + 3 * 32 + 3);

        let conv = graph.find("conv").ok_or("conv")?;
        let split = graph.find("split").ok_or("split")?;
        assert!(std::ptr::eq(graph.output(conv), graph.output(split)));
        assert!(std::ptr::eq(graph.mask(conv), graph.mask(split)));
        assert_eq!(graph.delta(split).shape().to_array::<3>(), [2, 8, 9]);
        Ok(())
    }

    #[test]
    fn test_input_validation() -> Result<(), Box<dyn Error>> {
        let mut builder = Graph::builder();
        builder.add("data", Layer::Input(Input::default()), &[])?;
        let mut graph = builder.build([1, 2, 2])?;

        assert!(matches!(
            graph.set_input(&Tensor::zeros([1, 2, 3])),
            Err(GraphError::Tensor(_))
        ));
        assert!(matches!(
            graph.set_input_mask(&Tensor::zeros([3, 2])),
            Err(GraphError::Tensor(_))
        ));
        graph.set_input(&Tensor::filled([1, 2, 2], 3.0))?;
        graph.forward();
        assert_eq!(graph.output(graph.input()).as_slice(), &[3.0; 4]);
        assert_eq!(graph.mask(graph.input()).as_slice(), &[1.0; 4]);
        Ok(())
    }

    #[test]
    fn test_priming() -> Result<(), Box<dyn Error>> {
        let mut builder = Graph::builder();
        let data = builder.add("data", Layer::Input(Input::default()), &[])?;
        let conv = builder.add("conv", ones_conv(1, 3, 1), &["data"])?;
        let mut graph = builder.build([1, 4, 4])?;
        assert_eq!(graph.node(conv).pass(), Pass::Dense);

        graph.set_masks_enabled(true);
        assert_eq!(graph.node(conv).pass(), Pass::Priming);

        // the priming pass ignores the injected mask and publishes all-dirty masks
        graph.set_input(&Tensor::filled([1, 4, 4], 1.0))?;
        graph.set_input_mask(&Tensor::zeros([4, 4]))?;
        graph.forward();
        assert!(graph.node(conv).primed());
        assert_eq!(graph.dirty_count(data), 16);
        assert_eq!(graph.dirty_count(conv), 16);
        assert_eq!(graph.output(conv)[[0, 0, 0]], 4.0);
        assert_eq!(graph.output(conv)[[0, 1, 1]], 9.0);

        // steady state: a single dirty input pixel
        let mut frame = Tensor::filled([1, 4, 4], 1.0);
        frame[[0, 3, 3]] = 2.0;
        frame[[0, 0, 0]] = 5.0;
        let mut mask = Tensor::zeros([4, 4]);
        mask[[3, 3]] = 1.0;
        graph.set_input(&frame)?;
        graph.set_input_mask(&mask)?;
        graph.forward();
        assert_eq!(graph.dirty_count(conv), 4);
        assert_eq!(graph.output(conv)[[0, 3, 3]], 5.0);
        // outside of the mask nothing is recomputed
        assert_eq!(graph.output(conv)[[0, 0, 0]], 4.0);

        graph.set_mask_enabled(conv, false);
        graph.forward();
        assert!(!graph.node(conv).primed());
        assert_eq!(graph.output(conv)[[0, 0, 0]], 8.0);
        Ok(())
    }
}
