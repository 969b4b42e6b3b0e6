//! Per-frame driver tying a [`ChangeDetector`] to a [`Graph`].

use std::time::Duration;

use instant::Instant;
use itertools::Itertools;

use crate::{
    config::RuntimeConfig,
    graph::{Graph, GraphError, NodeId, Pass},
    loom::tensor::Tensor,
    stats::mask_density,
    video::ChangeDetector,
};

/// What happened while processing one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Zero-based index of the frame since the runner was created.
    pub frame: usize,
    /// Fraction of input pixels reported dirty by the change detector.
    pub input_density: f32,
    /// Whether the detected mask drove this pass. It does not while masking is off or priming.
    pub mask_injected: bool,
    /// Dirty pixel count of every node's mask after the forward pass.
    pub dirty: Vec<(NodeId, usize)>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Runner {
    graph: Graph,
    detector: ChangeDetector,
    config: RuntimeConfig,
    frame: usize,
}

impl Runner {
    pub fn new(mut graph: Graph, config: RuntimeConfig) -> Result<Self, GraphError> {
        let [channels, _, _] = graph.node(graph.input()).shape();
        if !config.mean.is_empty() && config.mean.len() != channels {
            return Err(GraphError::Config(format!(
                "{} mean values for {channels} input channels",
                config.mean.len()
            )));
        }

        graph.set_masks_enabled(config.mask_enabled);
        let detector = ChangeDetector::new(config.change_threshold);
        Ok(Self {
            graph,
            detector,
            config,
            frame: 0,
        })
    }

    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Toggles masking on every node. Enabling primes the whole graph on the next frame.
    pub fn set_mask_enabled(&mut self, enabled: bool) {
        if self.config.mask_enabled != enabled {
            log::info!(
                "masking {} at frame {}",
                if enabled { "enabled" } else { "disabled" },
                self.frame
            );
        }
        self.config.mask_enabled = enabled;
        self.graph.set_masks_enabled(enabled);
    }

    /// Runs the graph on the next frame `[C, H, W]`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn process(&mut self, frame: &Tensor<f32>) -> Result<FrameReport, GraphError> {
        let start = Instant::now();

        let mut input = frame.clone();
        if !self.config.mean.is_empty() {
            let mean = self.config.mean.iter().map(|x| -x).collect_vec();
            input.add_channel_bias(&mean);
        }
        self.graph.set_input(&input)?;

        let mask = self.detector.detect(frame);
        let input_density = mask_density(&mask);
        let input = self.graph.input();
        let mask_injected = self.graph.node(input).pass() == Pass::Masked;
        if mask_injected {
            self.graph.set_input_mask(&mask)?;
            if input_density == 0.0 {
                log::debug!("frame {}: no change detected", self.frame);
            }
        }

        self.graph.forward();

        let dirty = self
            .graph
            .ids()
            .map(|id| (id, self.graph.dirty_count(id)))
            .collect();
        let report = FrameReport {
            frame: self.frame,
            input_density,
            mask_injected,
            dirty,
            elapsed: start.elapsed(),
        };
        log::trace!("frame {} took {:?}", report.frame, report.elapsed);

        self.frame += 1;
        Ok(report)
    }
}
