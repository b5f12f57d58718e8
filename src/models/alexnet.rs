//! AlexNet feature extractor.
//!
//! See "ImageNet Classification with Deep Convolutional Neural Networks" Krizhevsky et al. 2012
//! <https://papers.nips.cc/paper/4824-imagenet-classification-with-deep-convolutional-neural-networks>
//!
//! Only the convolutional `features` part is implemented, with one named entry per layer
//! using the torchvision indices so that `features.N.weight` checkpoints load as is.
use candle::Result;
use candle_nn::{Conv2dConfig, FuncT, VarBuilder};

use crate::models::with_tracing::conv2d;

/// Channels produced by the last convolution.
pub const FEATURE_CHANNELS: usize = 256;

fn conv(
    c_in: usize,
    c_out: usize,
    ksize: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let cfg = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    let conv = conv2d(c_in, c_out, ksize, cfg, vb)?;
    Ok(FuncT::new(move |xs, _train| xs.apply(&conv)))
}

fn relu() -> FuncT<'static> {
    FuncT::new(|xs, _train| xs.relu())
}

fn max_pool() -> FuncT<'static> {
    FuncT::new(|xs, _train| xs.max_pool2d_with_stride(3, 2))
}

/// The 13 feature layers, named `"0"` to `"12"`.
pub fn features(vb: VarBuilder) -> Result<Vec<(String, FuncT<'static>)>> {
    let layers = vec![
        conv(3, 64, 11, 4, 2, vb.pp(0))?,
        relu(),
        max_pool(),
        conv(64, 192, 5, 1, 2, vb.pp(3))?,
        relu(),
        max_pool(),
        conv(192, 384, 3, 1, 1, vb.pp(6))?,
        relu(),
        conv(384, 256, 3, 1, 1, vb.pp(8))?,
        relu(),
        conv(256, FEATURE_CHANNELS, 3, 1, 1, vb.pp(10))?,
        relu(),
        max_pool(),
    ];
    Ok(layers
        .into_iter()
        .enumerate()
        .map(|(index, layer)| (index.to_string(), layer))
        .collect())
}
