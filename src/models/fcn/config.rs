use serde::Deserialize;

use super::head::{DEFAULT_COMPRESS, DEFAULT_DROPOUT, DEFAULT_NUM_CLASSES};
use crate::models::{alexnet, resnet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    AlexNet,
    ResNet50,
    ResNet101,
}

impl BackboneKind {
    /// Channels of the feature map fed to the main head.
    pub fn out_channels(&self) -> usize {
        match self {
            Self::AlexNet => alexnet::FEATURE_CHANNELS,
            Self::ResNet50 | Self::ResNet101 => resnet::FEATURE_CHANNELS,
        }
    }

    /// Channels of the feature map fed to the auxiliary head, if the backbone has one.
    /// The AlexNet tap sits after the last 256 channel convolution.
    pub fn aux_channels(&self) -> Option<usize> {
        match self {
            Self::AlexNet => Some(alexnet::FEATURE_CHANNELS),
            Self::ResNet50 | Self::ResNet101 => None,
        }
    }
}

fn default_num_classes() -> usize {
    DEFAULT_NUM_CLASSES
}

fn default_compress() -> usize {
    DEFAULT_COMPRESS
}

fn default_dropout() -> f32 {
    DEFAULT_DROPOUT
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub backbone: BackboneKind,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_compress")]
    pub compress: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Whether to attach the auxiliary head, defaults to true when the backbone has an
    /// auxiliary feature map.
    #[serde(default)]
    pub aux: Option<bool>,
}

impl Config {
    fn with_backbone(backbone: BackboneKind) -> Self {
        Self {
            backbone,
            num_classes: DEFAULT_NUM_CLASSES,
            compress: DEFAULT_COMPRESS,
            dropout: DEFAULT_DROPOUT,
            aux: None,
        }
    }

    pub fn alexnet() -> Self {
        Self::with_backbone(BackboneKind::AlexNet)
    }

    pub fn resnet50() -> Self {
        Self::with_backbone(BackboneKind::ResNet50)
    }

    pub fn resnet101() -> Self {
        Self::with_backbone(BackboneKind::ResNet101)
    }

    pub fn aux_enabled(&self) -> bool {
        self.aux.unwrap_or(self.backbone.aux_channels().is_some())
    }
}
