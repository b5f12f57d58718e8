pub mod alexnet;
pub mod fcn;
pub mod resnet;
pub mod with_tracing;
