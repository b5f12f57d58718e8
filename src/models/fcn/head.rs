use candle::{ModuleT, Result, Tensor};
use candle_nn::{Conv2dConfig, Dropout, VarBuilder};

use crate::models::with_tracing::{batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d};

pub const DEFAULT_NUM_CLASSES: usize = 21;
pub const DEFAULT_COMPRESS: usize = 4;
pub const DEFAULT_DROPOUT: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    /// Ratio between the input channels and the width of the hidden layer.
    pub compress: usize,
    pub dropout: f32,
}

impl HeadConfig {
    pub fn new(in_channels: usize, num_classes: usize) -> Self {
        Self {
            in_channels,
            num_classes,
            compress: DEFAULT_COMPRESS,
            dropout: DEFAULT_DROPOUT,
        }
    }

    pub fn inter_channels(&self) -> usize {
        self.in_channels.checked_div(self.compress).unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        if self.compress == 0 {
            candle::bail!("fcn head compress ratio must be positive")
        }
        if self.inter_channels() == 0 {
            candle::bail!(
                "fcn head with {} input channels and compress {} has no hidden channels",
                self.in_channels,
                self.compress
            )
        }
        if self.num_classes == 0 {
            candle::bail!("fcn head needs at least one output class")
        }
        if !(0. ..1.).contains(&self.dropout) {
            candle::bail!("fcn head dropout {} not in [0, 1)", self.dropout)
        }
        Ok(())
    }
}

/// conv3x3 -> batch-norm -> relu -> dropout -> conv1x1, keeping the spatial size.
///
/// Weights use the torchvision layout: `0` for the first convolution, `1` for the
/// batch-norm and `4` for the final projection.
#[derive(Debug)]
pub struct FcnHead {
    conv: Conv2d,
    bn: BatchNorm,
    dropout: Dropout,
    classifier: Conv2d,
    config: HeadConfig,
    span: tracing::Span,
}

impl FcnHead {
    pub fn new(config: HeadConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let inter_channels = config.inter_channels();
        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 1,
            ..Default::default()
        };
        let conv = conv2d_no_bias(config.in_channels, inter_channels, 3, conv_cfg, vb.pp(0))?;
        let bn = batch_norm(inter_channels, 1e-5, vb.pp(1))?;
        let dropout = Dropout::new(config.dropout);
        let classifier = conv2d(
            inter_channels,
            config.num_classes,
            1,
            Default::default(),
            vb.pp(4),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "fcn-head");
        Ok(Self {
            conv,
            bn,
            dropout,
            classifier,
            config,
            span,
        })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn inter_channels(&self) -> usize {
        self.config.inter_channels()
    }
}

impl ModuleT for FcnHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.apply(&self.conv)?
            .apply_t(&self.bn, train)?
            .relu()?
            .apply_t(&self.dropout, train)?
            .apply(&self.classifier)
    }
}
