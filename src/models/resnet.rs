//! ResNet feature extractor.
//!
//! See "Deep Residual Learning for Image Recognition" He et al. 2015
//! <https://arxiv.org/abs/1512.03385>
//!
//! The network is flattened into a list of named layers: the four stem layers
//! (`conv1`, `bn1`, `relu`, `maxpool`) followed by one entry per bottleneck block
//! (`layer1.0`, `layer1.1`, ...). The pooling and fully connected layers are omitted.
use candle::{ModuleT, Result, D};
use candle_nn::{Conv2dConfig, FuncT, VarBuilder};

use crate::models::with_tracing::{batch_norm, conv2d_no_bias, BatchNorm, Conv2d};

/// Bottleneck blocks per stage.
pub const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
pub const RESNET101_BLOCKS: [usize; 4] = [3, 4, 23, 3];

const EXPANSION: usize = 4;

/// Channels produced by the last stage.
pub const FEATURE_CHANNELS: usize = EXPANSION * 512;

fn conv(
    c_in: usize,
    c_out: usize,
    ksize: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let conv2d_cfg = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    conv2d_no_bias(c_in, c_out, ksize, conv2d_cfg, vb)
}

fn downsample(
    c_in: usize,
    c_out: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<Option<(Conv2d, BatchNorm)>> {
    if stride != 1 || c_in != c_out {
        let conv = conv(c_in, c_out, 1, 0, stride, vb.pp(0))?;
        let bn = batch_norm(c_out, 1e-5, vb.pp(1))?;
        Ok(Some((conv, bn)))
    } else {
        Ok(None)
    }
}

fn bottleneck_block(
    c_in: usize,
    c_out: usize,
    stride: usize,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    let e_dim = EXPANSION * c_out;
    let conv1 = conv(c_in, c_out, 1, 0, 1, vb.pp("conv1"))?;
    let bn1 = batch_norm(c_out, 1e-5, vb.pp("bn1"))?;
    let conv2 = conv(c_out, c_out, 3, 1, stride, vb.pp("conv2"))?;
    let bn2 = batch_norm(c_out, 1e-5, vb.pp("bn2"))?;
    let conv3 = conv(c_out, e_dim, 1, 0, 1, vb.pp("conv3"))?;
    let bn3 = batch_norm(e_dim, 1e-5, vb.pp("bn3"))?;
    let downsample = downsample(c_in, e_dim, stride, vb.pp("downsample"))?;
    Ok(FuncT::new(move |xs, train| {
        let ys = xs
            .apply(&conv1)?
            .apply_t(&bn1, train)?
            .relu()?
            .apply(&conv2)?
            .apply_t(&bn2, train)?
            .relu()?
            .apply(&conv3)?
            .apply_t(&bn3, train)?;
        let identity = match &downsample {
            None => xs.clone(),
            Some((conv, bn)) => xs.apply(conv)?.apply_t(bn, train)?,
        };
        (identity + ys)?.relu()
    }))
}

/// Name of the `index`-th block of stage `stage`, stages are numbered from 1.
pub fn block_name(stage: usize, index: usize) -> String {
    format!("layer{stage}.{index}")
}

/// Builds the flattened feature layers for the given per-stage block counts.
pub fn bottleneck_features(
    blocks: [usize; 4],
    vb: VarBuilder,
) -> Result<Vec<(String, FuncT<'static>)>> {
    let conv1 = conv(3, 64, 7, 3, 2, vb.pp("conv1"))?;
    let bn1 = batch_norm(64, 1e-5, vb.pp("bn1"))?;
    let mut layers = Vec::with_capacity(4 + blocks.iter().sum::<usize>());
    layers.push((
        "conv1".to_string(),
        FuncT::new(move |xs, _train| xs.apply(&conv1)),
    ));
    layers.push((
        "bn1".to_string(),
        FuncT::new(move |xs, train| bn1.forward_t(xs, train)),
    ));
    layers.push(("relu".to_string(), FuncT::new(|xs, _train| xs.relu())));
    // The activations are non-negative so replicating the border is the same as
    // padding with -inf.
    layers.push((
        "maxpool".to_string(),
        FuncT::new(|xs, _train| {
            xs.pad_with_same(D::Minus1, 1, 1)?
                .pad_with_same(D::Minus2, 1, 1)?
                .max_pool2d_with_stride(3, 2)
        }),
    ));
    let mut c_in = 64;
    for (stage, &cnt) in blocks.iter().enumerate() {
        let c_out = 64 << stage;
        let stride = if stage == 0 { 1 } else { 2 };
        let vb = vb.pp(format!("layer{}", stage + 1));
        for index in 0..cnt {
            let stride = if index == 0 { stride } else { 1 };
            let block = bottleneck_block(c_in, c_out, stride, vb.pp(index))?;
            layers.push((block_name(stage + 1, index), block));
            c_in = EXPANSION * c_out;
        }
    }
    Ok(layers)
}

pub fn resnet50_features(vb: VarBuilder) -> Result<Vec<(String, FuncT<'static>)>> {
    bottleneck_features(RESNET50_BLOCKS, vb)
}

pub fn resnet101_features(vb: VarBuilder) -> Result<Vec<(String, FuncT<'static>)>> {
    bottleneck_features(RESNET101_BLOCKS, vb)
}
