use itertools::Itertools;
use thiserror::Error;

use super::{
    num::{Float, Scalar},
    shape::{IntoShape, Shape},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: shape {0}'s size not match data len {1}")]
    Create(Shape, usize),
    #[error("tensor reshape error: shape {0}'s size not match shape {1}'s")]
    Reshape(Shape, Shape),
    #[error("tensor shape error: expected shape {0}, found {1}")]
    Shape(Shape, Shape),
}

/// A dense, row-major, owning tensor.
///
/// Cloning always deep-copies. To alias the same buffer under other dimensions,
/// borrow a [`TensorView`] or [`TensorViewMut`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    shape: Shape,
    data: Vec<T>,
}

/// A non-owning, read-only alias of a tensor's buffer.
#[derive(Debug, Clone)]
pub struct TensorView<'a, T> {
    shape: Shape,
    data: &'a [T],
}

/// A non-owning, mutable alias of a tensor's buffer.
#[derive(Debug)]
pub struct TensorViewMut<'a, T> {
    shape: Shape,
    data: &'a mut [T],
}

impl<T: Scalar> Tensor<T> {
    /// Create a tensor of zeros.
    #[inline]
    pub fn zeros(shape: impl IntoShape) -> Self {
        let shape = shape.into_shape();
        let data = vec![T::zeroed(); shape.size()];
        Self { shape, data }
    }

    /// Create a tensor with every element set to `value`.
    #[inline]
    pub fn filled(shape: impl IntoShape, value: T) -> Self {
        let shape = shape.into_shape();
        let data = vec![value; shape.size()];
        Self { shape, data }
    }

    /// Create a tensor that takes ownership of `data`.
    #[inline]
    pub fn from_data(shape: impl IntoShape, data: impl Into<Vec<T>>) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        let data = data.into();
        if shape.size() != data.len() {
            return Err(TensorError::Create(shape, data.len()));
        }
        Ok(Self { shape, data })
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Changes the dimensions and zero-fills.
    /// The buffer is only reallocated if the element count changes.
    pub fn resize(&mut self, shape: impl IntoShape) {
        let shape = shape.into_shape();
        if shape.size() != self.data.len() {
            self.data = vec![T::zeroed(); shape.size()];
        } else {
            self.zero();
        }
        self.shape = shape;
    }

    /// Resizes only when the shape differs. A buffer that already fits keeps its contents.
    #[inline]
    pub fn ensure_shape(&mut self, shape: impl IntoShape) {
        let shape = shape.into_shape();
        if self.shape != shape {
            self.resize(shape);
        }
    }

    /// Reinterprets the dimensions, leaving the underlying data untouched.
    pub fn reshape(&mut self, shape: impl IntoShape) -> Result<(), TensorError> {
        let shape = shape.into_shape();
        if shape.size() != self.shape.size() {
            return Err(TensorError::Reshape(self.shape.clone(), shape));
        }
        self.shape = shape;
        Ok(())
    }

    /// Collapses the tensor into a single axis.
    #[inline]
    pub fn flatten(&mut self) {
        self.shape = [self.data.len()].into_shape();
    }

    #[inline]
    pub fn zero(&mut self) {
        self.fill(T::zeroed());
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Borrow the whole buffer under the tensor's own shape.
    #[inline]
    pub fn view(&self) -> TensorView<'_, T> {
        TensorView {
            shape: self.shape.clone(),
            data: &self.data,
        }
    }

    /// Borrow the whole buffer under another shape with the same element count.
    #[inline]
    pub fn view_as(&self, shape: impl IntoShape) -> Result<TensorView<'_, T>, TensorError> {
        self.view().reshape(shape)
    }

    #[inline]
    pub fn view_mut(&mut self) -> TensorViewMut<'_, T> {
        TensorViewMut {
            shape: self.shape.clone(),
            data: &mut self.data,
        }
    }

    #[inline]
    pub fn view_mut_as(
        &mut self,
        shape: impl IntoShape,
    ) -> Result<TensorViewMut<'_, T>, TensorError> {
        self.view_mut().reshape(shape)
    }

    /// Converts every element into another scalar type through `f32`.
    pub fn convert<U: Scalar>(&self) -> Tensor<U> {
        let shape = self.shape.clone();
        let data = self
            .data
            .iter()
            .map(|&x| U::from_f32(x.to_f32()))
            .collect();
        Tensor { shape, data }
    }

    /// Checks that the tensor has exactly `shape`.
    #[inline]
    pub fn check_shape(&self, shape: &Shape) -> Result<(), TensorError> {
        match &self.shape == shape {
            true => Ok(()),
            false => Err(TensorError::Shape(shape.clone(), self.shape.clone())),
        }
    }
}

impl<T: Scalar> Default for Tensor<T> {
    fn default() -> Self {
        Self::zeros([0])
    }
}

impl<T: Float> Tensor<T> {
    /// Arithmetic mean of all elements.
    ///
    /// # Panics
    /// Panics if the tensor is empty.
    pub fn mean(&self) -> f32 {
        assert!(!self.is_empty(), "mean of an empty tensor");
        let sum: f32 = self.data.iter().map(|x| x.to_f32()).sum();
        sum / self.data.len() as f32
    }

    /// Largest element.
    ///
    /// # Panics
    /// Panics if the tensor is empty.
    pub fn max(&self) -> T {
        assert!(!self.is_empty(), "max of an empty tensor");
        self.data
            .iter()
            .copied()
            .fold(self.data[0], |max, x| if x > max { x } else { max })
    }

    pub fn add_scalar(&mut self, value: f32) {
        self.data
            .iter_mut()
            .for_each(|x| *x = T::from_f32(x.to_f32() + value));
    }

    pub fn mul_scalar(&mut self, value: f32) {
        self.data
            .iter_mut()
            .for_each(|x| *x = T::from_f32(x.to_f32() * value));
    }

    /// Adds `bias[c]` to every element of channel `c`.
    ///
    /// # Panics
    /// Panics if the bias length does not match the channel count.
    pub fn add_channel_bias(&mut self, bias: &[f32]) {
        let channels = self.shape.channels();
        assert_eq!(
            bias.len(),
            channels,
            "bias of length {} for tensor {}",
            bias.len(),
            self.shape
        );
        let [rows, cols] = self.shape.spatial();
        self.data
            .chunks_exact_mut(rows * cols)
            .zip_eq(bias)
            .for_each(|(channel, &bias)| {
                channel
                    .iter_mut()
                    .for_each(|x| *x = T::from_f32(x.to_f32() + bias))
            });
    }
}

impl<'a, T: Scalar> TensorView<'a, T> {
    /// Wrap a borrowed buffer.
    #[inline]
    pub fn new(shape: impl IntoShape, data: &'a [T]) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        if shape.size() != data.len() {
            return Err(TensorError::Create(shape, data.len()));
        }
        Ok(Self { shape, data })
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    #[inline]
    pub fn reshape(self, shape: impl IntoShape) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        if shape.size() != self.shape.size() {
            return Err(TensorError::Reshape(self.shape, shape));
        }
        Ok(Self {
            shape,
            data: self.data,
        })
    }

    /// Deep-copies the viewed elements into an owning tensor.
    #[inline]
    pub fn to_tensor(&self) -> Tensor<T> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.to_vec(),
        }
    }
}

impl<'a, T: Scalar> TensorViewMut<'a, T> {
    #[inline]
    pub fn new(shape: impl IntoShape, data: &'a mut [T]) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        if shape.size() != data.len() {
            return Err(TensorError::Create(shape, data.len()));
        }
        Ok(Self { shape, data })
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &*self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut *self.data
    }

    #[inline]
    pub fn reshape(self, shape: impl IntoShape) -> Result<Self, TensorError> {
        let shape = shape.into_shape();
        if shape.size() != self.shape.size() {
            return Err(TensorError::Reshape(self.shape, shape));
        }
        Ok(Self {
            shape,
            data: self.data,
        })
    }

    /// Reborrow as a read-only view.
    #[inline]
    pub fn as_view(&self) -> TensorView<'_, T> {
        TensorView {
            shape: self.shape.clone(),
            data: &*self.data,
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.data.fill(T::zeroed());
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}

macro_rules! impl_index {
    ($t:ident $(<$l:lifetime>)?) => {
        impl<$($l,)? T: Scalar> std::ops::Index<usize> for $t<$($l,)? T> {
            type Output = T;

            #[inline]
            fn index(&self, index: usize) -> &T {
                &self.data[index]
            }
        }

        impl<$($l,)? T: Scalar, const N: usize> std::ops::Index<[usize; N]> for $t<$($l,)? T> {
            type Output = T;

            #[inline]
            fn index(&self, index: [usize; N]) -> &T {
                &self.data[self.shape.offset(index)]
            }
        }
    };
}

macro_rules! impl_index_mut {
    ($t:ident $(<$l:lifetime>)?) => {
        impl<$($l,)? T: Scalar> std::ops::IndexMut<usize> for $t<$($l,)? T> {
            #[inline]
            fn index_mut(&mut self, index: usize) -> &mut T {
                &mut self.data[index]
            }
        }

        impl<$($l,)? T: Scalar, const N: usize> std::ops::IndexMut<[usize; N]> for $t<$($l,)? T> {
            #[inline]
            fn index_mut(&mut self, index: [usize; N]) -> &mut T {
                let offset = self.shape.offset(index);
                &mut self.data[offset]
            }
        }
    };
}

impl_index!(Tensor);
impl_index!(TensorView<'a>);
impl_index!(TensorViewMut<'a>);
impl_index_mut!(Tensor);
impl_index_mut!(TensorViewMut<'a>);
