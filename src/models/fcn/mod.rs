//! FCN segmentation models.
//!
//! A backbone produces named feature maps, the `"out"` map goes through the main
//! [`FcnHead`] and, when configured, the `"aux"` map goes through an auxiliary head.
//! Both score maps are resized back to the input resolution.
pub mod backbone;
pub mod config;
pub mod head;

use candle::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;

pub use backbone::{Backbone, FeatureMap, IntermediateLayers};
pub use config::{BackboneKind, Config};
pub use head::{FcnHead, HeadConfig};

use crate::models::{alexnet, resnet};

/// Name of the feature map consumed by the main head.
pub const OUT: &str = "out";
/// Name of the feature map consumed by the auxiliary head.
pub const AUX: &str = "aux";

// Capture points in the torchvision AlexNet feature indices.
const ALEXNET_AUX_LAYER: &str = "9";
const ALEXNET_OUT_LAYER: &str = "12";

// Number of flattened layers up to and including the last block of `layer4`.
const RESNET50_PREFIX: usize = 20;
const RESNET101_PREFIX: usize = 37;

/// Per-pixel class scores at the input resolution.
#[derive(Debug, Clone)]
pub struct FcnOutput {
    pub out: Tensor,
    pub aux: Option<Tensor>,
}

impl FcnOutput {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        match name {
            OUT => Some(&self.out),
            AUX => self.aux.as_ref(),
            _ => None,
        }
    }

    /// The outputs in production order, `aux` first when present.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Tensor)> {
        self.aux
            .iter()
            .map(|aux| (AUX, aux))
            .chain(std::iter::once((OUT, &self.out)))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(|(name, _)| name).collect()
    }
}

#[derive(Debug)]
pub struct Fcn {
    backbone: Box<dyn Backbone>,
    classifier: FcnHead,
    aux_classifier: Option<FcnHead>,
    span: tracing::Span,
}

impl Fcn {
    /// Builds one of the predefined backbone and head combinations.
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let head = HeadConfig {
            in_channels: config.backbone.out_channels(),
            num_classes: config.num_classes,
            compress: config.compress,
            dropout: config.dropout,
        };
        let aux_head = match (config.aux_enabled(), config.backbone.aux_channels()) {
            (false, _) => None,
            (true, Some(in_channels)) => Some(HeadConfig {
                in_channels,
                ..head
            }),
            (true, None) => {
                candle::bail!("{:?} backbone has no auxiliary feature map", config.backbone)
            }
        };
        let vb_b = vb.pp("backbone");
        let backbone = match config.backbone {
            BackboneKind::AlexNet => {
                let layers = alexnet::features(vb_b)?;
                let mut return_layers = vec![(ALEXNET_OUT_LAYER, OUT)];
                if aux_head.is_some() {
                    return_layers.push((ALEXNET_AUX_LAYER, AUX));
                }
                IntermediateLayers::new(layers, &return_layers)?
            }
            BackboneKind::ResNet50 => resnet_backbone(
                resnet::resnet50_features(vb_b)?,
                resnet::RESNET50_BLOCKS,
                RESNET50_PREFIX,
            )?,
            BackboneKind::ResNet101 => resnet_backbone(
                resnet::resnet101_features(vb_b)?,
                resnet::RESNET101_BLOCKS,
                RESNET101_PREFIX,
            )?,
        };
        tracing::debug!(
            backbone = ?config.backbone,
            depth = backbone.depth(),
            aux = aux_head.is_some(),
            "building fcn"
        );
        Self::with_backbone(Box::new(backbone), head, aux_head, vb)
    }

    /// Creates the heads under `classifier` and `aux_classifier` on top of `backbone`.
    pub fn with_backbone(
        backbone: Box<dyn Backbone>,
        head: HeadConfig,
        aux_head: Option<HeadConfig>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let classifier = FcnHead::new(head, vb.pp("classifier"))?;
        let aux_classifier = match aux_head {
            None => None,
            Some(aux_head) => Some(FcnHead::new(aux_head, vb.pp("aux_classifier"))?),
        };
        Self::from_parts(backbone, classifier, aux_classifier)
    }

    /// Assembles a model, checking that the backbone provides every feature map the
    /// heads need.
    pub fn from_parts(
        backbone: Box<dyn Backbone>,
        classifier: FcnHead,
        aux_classifier: Option<FcnHead>,
    ) -> Result<Self> {
        let outputs = backbone.output_names();
        if !outputs.contains(&OUT) {
            candle::bail!("backbone outputs {outputs:?} lack the `{OUT}` feature map")
        }
        if aux_classifier.is_some() && !outputs.contains(&AUX) {
            candle::bail!("auxiliary head set but backbone outputs {outputs:?} lack `{AUX}`")
        }
        let span = tracing::span!(tracing::Level::TRACE, "fcn");
        Ok(Self {
            backbone,
            classifier,
            aux_classifier,
            span,
        })
    }

    pub fn has_aux(&self) -> bool {
        self.aux_classifier.is_some()
    }

    pub fn classifier(&self) -> &FcnHead {
        &self.classifier
    }

    pub fn aux_classifier(&self) -> Option<&FcnHead> {
        self.aux_classifier.as_ref()
    }

    /// Inference forward pass.
    pub fn forward(&self, xs: &Tensor) -> Result<FcnOutput> {
        self.forward_t(xs, false)
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<FcnOutput> {
        let _enter = self.span.enter();
        let (_b, _c, h, w) = xs.dims4()?;
        if !xs.dtype().is_float() {
            candle::bail!("fcn expects a floating point input, got {:?}", xs.dtype())
        }
        let features = self.backbone.forward_features(xs, train)?;
        let aux = match &self.aux_classifier {
            None => None,
            Some(aux_classifier) => {
                let aux = aux_classifier.forward_t(features.require(AUX)?, train)?;
                Some(aux.upsample_bilinear2d(h, w, false)?)
            }
        };
        let out = self.classifier.forward_t(features.require(OUT)?, train)?;
        let out = out.upsample_bilinear2d(h, w, false)?;
        Ok(FcnOutput { out, aux })
    }
}

fn resnet_backbone(
    layers: Vec<(String, candle_nn::FuncT<'static>)>,
    blocks: [usize; 4],
    prefix: usize,
) -> Result<IntermediateLayers> {
    if layers.len() != prefix {
        candle::bail!(
            "resnet feature stack has {} layers, expected {prefix}",
            layers.len()
        )
    }
    let last_block = resnet::block_name(4, blocks[3] - 1);
    IntermediateLayers::new(layers, &[(last_block.as_str(), OUT)])
}

/// FCN on the AlexNet feature stack, the auxiliary head reads the output of layer 9.
pub fn fcn_alexnet(num_classes: usize, aux: bool, vb: VarBuilder) -> Result<Fcn> {
    let config = Config {
        num_classes,
        aux: Some(aux),
        ..Config::alexnet()
    };
    Fcn::new(&config, vb)
}

/// FCN on a ResNet-50 truncated after `layer4`.
pub fn fcn_resnet50(num_classes: usize, vb: VarBuilder) -> Result<Fcn> {
    let config = Config {
        num_classes,
        ..Config::resnet50()
    };
    Fcn::new(&config, vb)
}

/// FCN on a ResNet-101 truncated after `layer4`.
pub fn fcn_resnet101(num_classes: usize, vb: VarBuilder) -> Result<Fcn> {
    let config = Config {
        num_classes,
        ..Config::resnet101()
    };
    Fcn::new(&config, vb)
}
