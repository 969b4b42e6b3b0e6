use derive_more::Display;

/// Elementwise non-linearity applied to a layer's pre-activation `z`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Activation {
    #[display("relu")]
    ReLU,
    #[display("sigmoid")]
    Sigmoid,
    #[display("tanh")]
    Tanh,
    #[default]
    #[display("identity")]
    Identity,
}

impl Activation {
    /// Returns `(y, dy/dz)` at `z`.
    #[inline]
    pub fn eval(self, z: f32) -> (f32, f32) {
        match self {
            Activation::ReLU => match z > 0.0 {
                true => (z, 1.0),
                false => (0.0, 0.0),
            },
            Activation::Sigmoid => {
                let y = 1.0 / (1.0 + (-z).exp());
                (y, y * (1.0 - y))
            }
            Activation::Tanh => {
                let y = z.tanh();
                (y, 1.0 - y * y)
            }
            Activation::Identity => (z, 1.0),
        }
    }

    /// Applies the activation to every element of `z`, writing `y` and `dy/dz`.
    ///
    /// # Panics
    /// Panics if the slices differ in length.
    pub fn apply(self, z: &[f32], y: &mut [f32], dy_dz: &mut [f32]) {
        assert_eq!(z.len(), y.len());
        assert_eq!(z.len(), dy_dz.len());
        for ((&z, y), d) in z.iter().zip(y.iter_mut()).zip(dy_dz.iter_mut()) {
            (*y, *d) = self.eval(z);
        }
    }
}
