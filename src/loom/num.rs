use std::fmt::Debug;

use bytemuck::{Pod, Zeroable};
use half::f16;

/// An element type a [`Tensor`](super::tensor::Tensor) can hold.
///
/// Every scalar converts losslessly enough through `f32`, which is the type all kernels compute in.
/// Zero-initialization goes through [`Zeroable::zeroed`].
pub trait Scalar:
    Sized + Zeroable + Pod + PartialOrd + Debug + Send + Sync + sealed::Sealed
{
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

pub trait Float: Scalar {}

impl Scalar for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Scalar for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Scalar for u8 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    /// Saturates into `0..=255`.
    #[inline]
    fn from_f32(value: f32) -> Self {
        value.clamp(0.0, 255.0) as u8
    }
}

impl Scalar for u32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value.max(0.0) as u32
    }
}

impl Float for f32 {}
impl Float for f16 {}

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f16 {}
    impl Sealed for u8 {}
    impl Sealed for u32 {}
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;
    use half::f16;

    use super::Scalar;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(<u8 as Scalar>::from_f32(300.0), 255);
        assert_eq!(<u8 as Scalar>::from_f32(-4.0), 0);
        assert_eq!(<u32 as Scalar>::from_f32(7.9), 7);
        assert_eq!(Scalar::to_f32(f16::from_f32(0.5)), 0.5);
        assert_eq!(f16::zeroed(), f16::ZERO);
    }
}
