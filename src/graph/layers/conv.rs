use super::{LayerError, Operator, Params, single};
use crate::{
    graph::node::{Bottom, Buffers, Pass},
    hal::{
        activation::Activation,
        conv::{ConvGeometry, convolution_im2col, dirty_pixels, transposed_convolution_im2col},
        masked::{
            Workspace, col2im_masked, convolution_im2col_masked, convolve_mask_im2col,
            deconvolve_mask_col2im, place_buffer_back, transposed_convolution_im2col_masked,
        },
    },
    loom::tensor::Tensor,
};

/// Checks a `[a, b, f, f]` filter and builds its geometry.
fn filter_geometry(
    weights: &Tensor<f32>,
    stride: usize,
    pad: usize,
) -> Result<([usize; 2], ConvGeometry), LayerError> {
    let shape = weights.shape();
    let [a, b, fh, fw] = match shape.len() {
        4 => shape.to_array(),
        _ => {
            return Err(LayerError::Weights {
                expected: "a 4-d filter bank",
                found: shape.clone(),
            });
        }
    };
    if fh != fw || fh == 0 {
        return Err(LayerError::Weights {
            expected: "square filters",
            found: shape.clone(),
        });
    }
    if stride == 0 {
        return Err(LayerError::Parameter("stride must be positive".into()));
    }
    Ok(([a, b], ConvGeometry::new(fh, stride, pad)))
}

/// Spatial convolution `z = W ⋆ x + b`, `y = σ(z)`.
#[derive(Debug, Clone, masked_cnn_derive::Parametric)]
#[parametric(crate = "crate")]
pub struct Convolution {
    #[parametric]
    params: Params,
    geometry: ConvGeometry,
    /// Pre-activation.
    z: Tensor<f32>,
    dy_dz: Tensor<f32>,
    workspace: Workspace,
}

impl Convolution {
    /// ## Arguments
    /// * `weights` - Filter bank `[out_channels, in_channels, f, f]`.
    /// * `biases` - One bias per output channel.
    pub fn new(
        weights: Tensor<f32>,
        biases: Tensor<f32>,
        stride: usize,
        pad: usize,
        activation: Activation,
    ) -> Result<Self, LayerError> {
        let ([out_channels, _], geometry) = filter_geometry(&weights, stride, pad)?;
        let params = Params {
            weights,
            biases,
            activation,
        };
        params.check_biases(out_channels)?;
        Ok(Self {
            params,
            geometry,
            z: Tensor::default(),
            dy_dz: Tensor::default(),
            workspace: Workspace::default(),
        })
    }

    #[inline]
    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    #[inline]
    pub fn z(&self) -> &Tensor<f32> {
        &self.z
    }

    #[inline]
    pub fn dy_dz(&self) -> &Tensor<f32> {
        &self.dy_dz
    }
}

impl Operator for Convolution {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        let [channels, rows, cols] = single(bottoms)?;
        let [out_channels, in_channels, _, _] = self.params.weights.shape().to_array();
        let f = self.geometry.filter_size;
        let pad = self.geometry.pad;
        if channels != in_channels {
            return Err(LayerError::Bottom(
                [channels, rows, cols],
                format!("filter expects {in_channels} channels"),
            ));
        }
        if rows + 2 * pad < f || cols + 2 * pad < f {
            return Err(LayerError::Bottom(
                [channels, rows, cols],
                format!("smaller than filter {f} with padding {pad}"),
            ));
        }

        let [rows, cols] = self.geometry.output_shape([rows, cols]);
        let shape = [out_channels, rows, cols];
        self.z = Tensor::zeros(shape);
        self.dy_dz = Tensor::zeros(shape);
        Ok(shape)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "convolution", skip_all))]
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        let Bottom { output: input, mask } = bottoms[0];
        let Params {
            weights,
            biases,
            activation,
        } = &self.params;
        let workspace = &mut self.workspace;

        convolve_mask_im2col(
            mask.view(),
            buffers.mask.view_mut(),
            &mut workspace.mask_col,
            self.geometry,
        );

        match pass {
            Pass::Masked => {
                convolution_im2col_masked(
                    input.view(),
                    buffers.mask.view(),
                    weights.view(),
                    self.geometry,
                    &mut workspace.col,
                    &mut workspace.buffer,
                );
                place_buffer_back(
                    buffers.mask.view(),
                    workspace.buffer.as_slice(),
                    self.z.view_mut(),
                    Some(biases.as_slice()),
                );
            }
            Pass::Dense | Pass::Priming => {
                convolution_im2col(
                    input.view(),
                    weights.view(),
                    self.z.view_mut(),
                    self.geometry,
                    &mut workspace.col,
                );
                self.z.add_channel_bias(biases.as_slice());
            }
        }

        activation.apply(
            self.z.as_slice(),
            buffers.output.as_mut_slice(),
            self.dy_dz.as_mut_slice(),
        );
    }
}

/// Transposed convolution `z = Wᵀ ⋆ x + b`, `y = σ(z)`, upsampling by its stride.
#[derive(Debug, Clone, masked_cnn_derive::Parametric)]
#[parametric(crate = "crate")]
pub struct Deconvolution {
    #[parametric]
    params: Params,
    geometry: ConvGeometry,
    z: Tensor<f32>,
    dy_dz: Tensor<f32>,
    workspace: Workspace,
}

impl Deconvolution {
    /// ## Arguments
    /// * `weights` - Filter bank `[in_channels, out_channels, f, f]`.
    /// * `biases` - One bias per output channel.
    /// * `pad` - Must be smaller than the filter size.
    pub fn new(
        weights: Tensor<f32>,
        biases: Tensor<f32>,
        stride: usize,
        pad: usize,
        activation: Activation,
    ) -> Result<Self, LayerError> {
        let ([_, out_channels], geometry) = filter_geometry(&weights, stride, pad)?;
        if pad >= geometry.filter_size {
            return Err(LayerError::Parameter(format!(
                "over-full padding {pad} for filter {}",
                geometry.filter_size
            )));
        }
        let params = Params {
            weights,
            biases,
            activation,
        };
        params.check_biases(out_channels)?;
        Ok(Self {
            params,
            geometry,
            z: Tensor::default(),
            dy_dz: Tensor::default(),
            workspace: Workspace::default(),
        })
    }

    #[inline]
    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    #[inline]
    pub fn z(&self) -> &Tensor<f32> {
        &self.z
    }

    #[inline]
    pub fn dy_dz(&self) -> &Tensor<f32> {
        &self.dy_dz
    }
}

impl Operator for Deconvolution {
    fn infer(&mut self, bottoms: &[[usize; 3]]) -> Result<[usize; 3], LayerError> {
        let [channels, rows, cols] = single(bottoms)?;
        let [in_channels, out_channels, _, _] = self.params.weights.shape().to_array();
        if channels != in_channels {
            return Err(LayerError::Bottom(
                [channels, rows, cols],
                format!("filter expects {in_channels} channels"),
            ));
        }
        let [f, s, p] = [
            self.geometry.filter_size,
            self.geometry.stride,
            self.geometry.pad,
        ];
        if rows == 0 || cols == 0 || s * (rows.min(cols) - 1) + f <= 2 * p {
            return Err(LayerError::Bottom(
                [channels, rows, cols],
                format!("empty output under {}", self.geometry),
            ));
        }

        let [rows, cols] = self.geometry.transposed_output_shape([rows, cols]);
        let shape = [out_channels, rows, cols];
        self.z = Tensor::zeros(shape);
        self.dy_dz = Tensor::zeros(shape);
        Ok(shape)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "deconvolution", skip_all))]
    fn forward(&mut self, bottoms: &[Bottom<'_>], buffers: &mut Buffers, pass: Pass) {
        let Bottom { output: input, mask } = bottoms[0];
        let Params {
            weights,
            biases,
            activation,
        } = &self.params;
        let workspace = &mut self.workspace;

        deconvolve_mask_col2im(
            mask.view(),
            buffers.mask.view_mut(),
            &mut workspace.mask_col,
            self.geometry,
        );

        match pass {
            Pass::Masked => {
                transposed_convolution_im2col_masked(
                    input.view(),
                    buffers.mask.view(),
                    weights.view(),
                    self.geometry,
                    workspace,
                );
                col2im_masked(
                    workspace.col.as_slice(),
                    &workspace.pixels,
                    buffers.mask.view(),
                    self.geometry,
                    self.z.view_mut(),
                );

                let [_, rows, cols] = self.z.shape().to_array();
                let z = self.z.as_mut_slice();
                for pixel in dirty_pixels(buffers.mask.as_slice()) {
                    for (channel, &bias) in biases.as_slice().iter().enumerate() {
                        z[channel * rows * cols + pixel] += bias;
                    }
                }
            }
            Pass::Dense | Pass::Priming => {
                transposed_convolution_im2col(
                    input.view(),
                    weights.view(),
                    self.z.view_mut(),
                    self.geometry,
                    &mut workspace.col,
                );
                self.z.add_channel_bias(biases.as_slice());
            }
        }

        activation.apply(
            self.z.as_slice(),
            buffers.output.as_mut_slice(),
            self.dy_dz.as_mut_slice(),
        );
    }
}
