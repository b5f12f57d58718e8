//! Fully Convolutional Networks for semantic segmentation.
//!
//! See "Fully Convolutional Networks for Semantic Segmentation" Long et al. 2015
//! <https://arxiv.org/abs/1411.4038>
//!
//! The models pair a backbone feature extractor with a small convolutional
//! head and resize the per-pixel class scores back to the input resolution.
//!
//! ```no_run
//! use candle::{DType, Device, Tensor};
//! use candle_nn::VarBuilder;
//! use candle_fcn::models::fcn;
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let vb = VarBuilder::zeros(DType::F32, &device);
//! let model = fcn::fcn_resnet50(21, vb)?;
//! let image = Tensor::zeros((1, 3, 224, 224), DType::F32, &device)?;
//! let output = model.forward(&image)?;
//! assert_eq!(output.out.dims(), &[1, 21, 224, 224]);
//! # Ok(())
//! # }
//! ```
pub mod models;
