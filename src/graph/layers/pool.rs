use super::{LayerError, Operator, active_pixels, single};
use crate::{
    graph::node::{Bottom, Buffers, Pass},
    hal::{conv::ConvGeometry, masked::convolve_mask_im2col},
    loom::tensor::Tensor,
};

/// Max pooling over non-overlapping `window × window` cells.
#[derive(Debug, Clone)]
pub struct Pool {
    geometry: ConvGeometry,
    mask_col: Tensor<f32>,
}

impl Pool {
    pub fn new(window: usize) -> Result<Self, LayerError> {
        match window {
            0 => Err(LayerError::Parameter("pooling window must be positive".into())),
            window => Ok(Self {
                geometry: ConvGeometry::new(window, window, 0),
                mask_col: Tensor::default(),
            }),
        }
    }

    #[inline]
    pub fn window(&self) -> usize {
        self.geometry.filter_size
    }
}

impl Operator for Pool {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        let [channels, rows, cols] = single(bottoms)?;
        let window = self.window();
        if rows < window || cols < window {
            return Err(LayerError::Bottom(
                [channels, rows, cols],
                format!("smaller than pooling window {window}"),
            ));
        }
        let [rows, cols] = self.geometry.output_shape([rows, cols]);
        Ok([channels, rows, cols])
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "pool", skip_all))]
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        let Bottom { output: input, mask } = bottoms[0];
        convolve_mask_im2col(
            mask.view(),
            buffers.mask.view_mut(),
            &mut self.mask_col,
            self.geometry,
        );

        let window = self.window();
        let [channels, ih, iw] = input.shape().to_array();
        let [_, oh, ow] = buffers.output.shape().to_array();
        let input = input.as_slice();
        let output = buffers.output.as_mut_slice();
        for pixel in active_pixels(&buffers.mask, pass) {
            let (oy, ox) = (pixel / ow, pixel % ow);
            for c in 0..channels {
                let channel = &input[c * ih * iw..(c + 1) * ih * iw];
                output[c * oh * ow + pixel] = itertools::iproduct!(0..window, 0..window)
                    .map(|(fy, fx)| channel[(oy * window + fy) * iw + ox * window + fx])
                    .fold(f32::NEG_INFINITY, f32::max);
            }
        }
    }
}
