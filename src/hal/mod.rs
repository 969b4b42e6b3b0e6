//! Hardware abstraction layer: the numeric kernels the graph layers are built from.
//!
//! - [`blas`]: row-major single precision GEMM/GEMV.
//! - [`conv`]: dense convolution, transposed convolution and their im2col/col2im forms.
//! - [`masked`]: dirty-only counterparts of the GEMM convolutions and change-mask propagation.
//! - [`activation`]: elementwise non-linearities together with their local derivatives.

pub mod activation;
pub mod blas;
pub mod conv;
pub mod masked;
