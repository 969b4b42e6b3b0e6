use super::{NodeId, layers::Layer};
use crate::loom::{
    shape::IntoShape,
    tensor::{Tensor, TensorError},
};

/// How a node computes its output in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    /// Masking is off: recompute everything.
    Dense,
    /// First pass after masking was enabled: recompute everything and publish an all-dirty mask.
    Priming,
    /// Recompute dirty pixels only.
    Masked,
}

/// Per-node tensors that persist across frames.
#[derive(Debug, Default, Clone)]
pub struct Buffers {
    /// Activations `[C, H, W]`.
    pub output: Tensor<f32>,
    /// Error signal, shaped like `output`. Inference never writes it.
    pub delta: Tensor<f32>,
    /// Change mask `[H, W]` over the output.
    pub mask: Tensor<f32>,
}

impl Buffers {
    pub fn new([c, h, w]: [usize; 3]) -> Self {
        Self {
            output: Tensor::zeros([c, h, w]),
            delta: Tensor::zeros([c, h, w]),
            mask: Tensor::zeros([h, w]),
        }
    }

    /// Number of dirty pixels in the mask.
    #[inline]
    pub fn dirty_count(&self) -> usize {
        self.mask.as_slice().iter().filter(|&&x| x > 0.0).count()
    }
}

/// Read-only access to a predecessor's state during a forward pass.
#[derive(Debug, Clone, Copy)]
pub struct Bottom<'a> {
    pub output: &'a Tensor<f32>,
    pub mask: &'a Tensor<f32>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) layer: Layer,
    pub(crate) bottoms: Vec<NodeId>,
    pub(crate) buffers: Buffers,
    pub(crate) shape: [usize; 3],
    pub(crate) mask_enabled: bool,
    pub(crate) primed: bool,
}

impl Node {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    #[inline]
    pub fn bottoms(&self) -> &[NodeId] {
        &self.bottoms
    }

    /// Output dimensions `[C, H, W]` fixed at build time.
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    #[inline]
    pub fn mask_enabled(&self) -> bool {
        self.mask_enabled
    }

    /// Whether the node has completed its priming pass and now runs masked.
    #[inline]
    pub fn primed(&self) -> bool {
        self.primed
    }

    /// Enables or disables masking. Enabling schedules a priming pass.
    pub fn set_mask_enabled(&mut self, enabled: bool) {
        if self.mask_enabled != enabled {
            self.primed = false;
        }
        self.mask_enabled = enabled;
    }

    /// The pass the next forward will run.
    #[inline]
    pub fn pass(&self) -> Pass {
        match (self.mask_enabled, self.primed) {
            (false, _) => Pass::Dense,
            (true, false) => Pass::Priming,
            (true, true) => Pass::Masked,
        }
    }

    pub(crate) fn forward(&mut self, bottoms: &[Bottom<'_>]) {
        let pass = self.pass();
        self.layer.forward(bottoms, &mut self.buffers, pass);
        if pass == Pass::Priming {
            self.buffers.mask.fill(1.0);
        }
        self.primed = self.mask_enabled;

        #[cfg(feature = "strict")]
        if let Err(err) = self.check_shapes() {
            panic!("node {} produced an invalid output: {err}", self.name);
        }
        #[cfg(not(feature = "strict"))]
        debug_assert!(self.check_shapes().is_ok());

        log::trace!(
            "{} ({pass:?}): {} of {} pixels dirty",
            self.name,
            self.buffers.dirty_count(),
            self.buffers.mask.len()
        );
    }

    fn check_shapes(&self) -> Result<(), TensorError> {
        if matches!(self.layer, Layer::PassThrough) {
            return Ok(());
        }
        let [c, h, w] = self.shape;
        self.buffers.output.check_shape(&[c, h, w].into_shape())?;
        self.buffers.mask.check_shape(&[h, w].into_shape())
    }
}
