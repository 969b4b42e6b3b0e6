use super::{LayerError, Operator};
use crate::graph::node::{Bottom, Buffers, Pass};

/// Entry point of the graph. Its output holds the current frame `[C, H, W]`.
///
/// The mask is the one injected for this frame, or all dirty if none was injected or the node is
/// priming. An injected mask is consumed by the next forward pass.
#[derive(Debug, Default, Clone)]
pub struct Input {
    shape: [usize; 3],
    injected: bool,
}

impl Input {
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    #[inline]
    pub(crate) fn bind(&mut self, shape: [usize; 3]) {
        self.shape = shape;
    }

    #[inline]
    pub(crate) fn inject(&mut self) {
        self.injected = true;
    }
}

impl Operator for Input {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        match (bottoms.len(), self.shape.contains(&0)) {
            (0, false) => Ok(self.shape),
            (0, true) => Err(LayerError::Bottom(self.shape, "empty frame".into())),
            (len, _) => Err(LayerError::Parameter(format!(
                "input takes no bottoms, found {len}"
            ))),
        }
    }

    fn forward(&mut self, _: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        if !self.injected || pass == Pass::Priming {
            buffers.mask.fill(1.0);
        }
        self.injected = false;
    }
}
