//! The `loom` module provides the numeric containers every kernel and layer works on.
//!
//! ## Key Components
//! 1. **Numerical System**:
//!    - Scalar types (`f32`, `f16`, `u8`, `u32`) behind the sealed [`num::Scalar`] trait.
//!
//! 2. **Shapes**:
//!    - Row-major dimension lists of 1 to 4 axes, `[outer-channel, channel, row, col]`.
//!
//! 3. **Tensors**:
//!    - Owning [`tensor::Tensor`] with resize/reshape and elementwise helpers.
//!    - Borrowed [`tensor::TensorView`]/[`tensor::TensorViewMut`] that reinterpret a buffer
//!      under other dimensions, e.g. a `[H, W]` change mask seen as `[1, H, W]`.

pub mod num;
pub mod shape;
pub mod tensor;
