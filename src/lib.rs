//! Change-masked inference for convolutional networks over video.
//!
//! A [`graph::Graph`] keeps every layer's output between frames. Each frame, a change mask derived
//! from the difference to the previous frame is pushed through the graph, and layers only recompute
//! the output pixels whose receptive field touches a changed input region.

pub mod config;
pub mod graph;
pub mod hal;
pub mod loom;
pub mod runner;
pub mod stats;
#[cfg(feature = "trace")]
pub mod trace;
pub mod video;

pub use masked_cnn_derive::Parametric;
