use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;

/// Maximum number of axes a tensor may carry: `[outer-channel, channel, row, col]`.
pub const MAX_AXES: usize = 4;

/// Dimension sizes of a row-major tensor, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

pub trait IntoShape {
    fn into_shape(self) -> Shape;
}

impl IntoShape for Shape {
    #[inline]
    fn into_shape(self) -> Shape {
        self
    }
}

impl IntoShape for &Shape {
    #[inline]
    fn into_shape(self) -> Shape {
        self.clone()
    }
}

impl<const N: usize> IntoShape for [usize; N] {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new(self.to_vec())
    }
}

impl IntoShape for &[usize] {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new(self.to_vec())
    }
}

impl IntoShape for Vec<usize> {
    #[inline]
    fn into_shape(self) -> Shape {
        Shape::new(self)
    }
}

impl Shape {
    /// Creates a shape from dimension sizes.
    ///
    /// # Panics
    /// Panics if there are no axes or more than [`MAX_AXES`].
    #[inline]
    pub fn new(dims: Vec<usize>) -> Self {
        assert!(
            (1..=MAX_AXES).contains(&dims.len()),
            "tensor must have 1 to {MAX_AXES} axes, got {}",
            dims.len()
        );
        Self(dims.into())
    }

    /// Number of elements described by the shape.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }

    /// Returns the dimensions as a fixed-size array.
    ///
    /// # Panics
    /// Panics if the shape does not have exactly `N` axes.
    #[inline]
    pub fn to_array<const N: usize>(&self) -> [usize; N] {
        assert_eq!(self.len(), N, "expected a {N}-d shape, got {self}");
        std::array::from_fn(|index| self[index])
    }

    /// The `[rows, cols]` of the two innermost axes.
    #[inline]
    pub fn spatial(&self) -> [usize; 2] {
        match self.len() {
            1 => [1, self[0]],
            len => [self[len - 2], self[len - 1]],
        }
    }

    /// Product of all axes outside of the two innermost ones.
    #[inline]
    pub fn channels(&self) -> usize {
        let [rows, cols] = self.spatial();
        self.size() / (rows * cols).max(1)
    }

    /// Row-major flat offset of a coordinate.
    ///
    /// # Panics
    /// Panics if the coordinate has the wrong number of axes or is out of bounds.
    #[inline]
    pub fn offset<const N: usize>(&self, index: [usize; N]) -> usize {
        assert_eq!(
            self.len(),
            N,
            "index {index:?} does not match tensor shape {self}"
        );
        index
            .iter()
            .zip_eq(self.iter())
            .fold(0, |offset, (&index, &dim)| {
                assert!(index < dim, "index {index} out of bounds for axis of size {dim}");
                offset * dim + index
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{IntoShape, Shape};

    #[test]
    fn test_shape_offsets() {
        let shape = [2, 3, 4, 5].into_shape();
        assert_eq!(shape.size(), 120);
        assert_eq!(shape.offset([0, 0, 0, 0]), 0);
        assert_eq!(shape.offset([1, 2, 3, 4]), 119);
        assert_eq!(shape.offset([1, 0, 1, 0]), 65);
        assert_eq!(shape.spatial(), [4, 5]);
        assert_eq!(shape.channels(), 6);
        assert_eq!(shape.to_string(), "[2, 3, 4, 5]");
    }

    #[test]
    fn test_flat_shape() {
        let shape = vec![7].into_shape();
        assert_eq!(shape.spatial(), [1, 7]);
        assert_eq!(shape.channels(), 1);
        assert_eq!(shape.to_array::<1>(), [7]);
    }

    #[test]
    #[should_panic]
    fn test_offset_out_of_bounds() {
        let shape = [3, 3].into_shape();
        shape.offset([3, 0]);
    }

    #[test]
    #[should_panic]
    fn test_too_many_axes() {
        Shape::new(vec![1, 1, 1, 1, 1]);
    }
}
