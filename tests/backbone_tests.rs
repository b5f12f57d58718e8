use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_fcn::models::fcn::{Backbone, FeatureMap, IntermediateLayers};
use candle_fcn::models::{alexnet, resnet};
use candle_nn::{FuncT, VarBuilder};

fn arithmetic_layers() -> Vec<(String, FuncT<'static>)> {
    vec![
        ("add".to_string(), FuncT::new(|xs, _| xs + 1.)),
        ("double".to_string(), FuncT::new(|xs, _| xs * 2.)),
        ("sub".to_string(), FuncT::new(|xs, _| xs - 3.)),
        // Only runs in training mode to check that the flag is forwarded.
        (
            "train-only".to_string(),
            FuncT::new(|xs, train| if train { xs * 10. } else { Ok(xs.clone()) }),
        ),
    ]
}

#[test]
fn captures_in_traversal_order() -> Result<()> {
    let backbone =
        IntermediateLayers::new(arithmetic_layers(), &[("sub", "out"), ("double", "aux")])?;
    assert_eq!(backbone.output_names(), ["aux", "out"]);
    // Layers after the last capture point are never run.
    assert_eq!(backbone.depth(), 3);
    assert_eq!(
        backbone.layer_names().collect::<Vec<_>>(),
        ["add", "double", "sub"]
    );

    let xs = Tensor::new(&[1f32, 2.], &Device::Cpu)?;
    let features = backbone.forward_features(&xs, false)?;
    assert_eq!(features.names().collect::<Vec<_>>(), ["aux", "out"]);
    assert_eq!(features.require("aux")?.to_vec1::<f32>()?, [4., 6.]);
    assert_eq!(features.require("out")?.to_vec1::<f32>()?, [1., 3.]);
    Ok(())
}

#[test]
fn forwards_train_flag() -> Result<()> {
    let backbone = IntermediateLayers::new(arithmetic_layers(), &[("train-only", "out")])?;
    let xs = Tensor::new(&[1f32], &Device::Cpu)?;
    let eval = backbone.forward_features(&xs, false)?;
    let train = backbone.forward_features(&xs, true)?;
    assert_eq!(eval.require("out")?.to_vec1::<f32>()?, [1.]);
    assert_eq!(train.require("out")?.to_vec1::<f32>()?, [10.]);
    Ok(())
}

#[test]
fn rejects_bad_capture_points() {
    let err = IntermediateLayers::new(arithmetic_layers(), &[("missing", "out")]).unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");
    assert!(IntermediateLayers::new(arithmetic_layers(), &[]).is_err());
    assert!(
        IntermediateLayers::new(arithmetic_layers(), &[("add", "out"), ("sub", "out")]).is_err()
    );
    assert!(
        IntermediateLayers::new(arithmetic_layers(), &[("add", "out"), ("add", "aux")]).is_err()
    );
    let mut layers = arithmetic_layers();
    layers.push(("add".to_string(), FuncT::new(|xs, _| Ok(xs.clone()))));
    assert!(IntermediateLayers::new(layers, &[("sub", "out")]).is_err());
}

#[test]
fn feature_map() -> Result<()> {
    let mut features = FeatureMap::new();
    assert!(features.is_empty());
    features.insert("out", Tensor::new(&[1f32], &Device::Cpu)?);
    features.insert("aux", Tensor::new(&[2f32], &Device::Cpu)?);
    features.insert("out", Tensor::new(&[3f32], &Device::Cpu)?);
    assert_eq!(features.len(), 2);
    assert_eq!(features.names().collect::<Vec<_>>(), ["out", "aux"]);
    assert_eq!(features.require("out")?.to_vec1::<f32>()?, [3.]);
    let values = features
        .iter()
        .map(|(name, xs)| Ok::<_, anyhow::Error>((name, xs.to_vec1::<f32>()?[0])))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(values, [("out", 3.), ("aux", 2.)]);
    assert!(features.get("missing").is_none());
    let err = features.require("missing").unwrap_err();
    assert!(err.to_string().contains("missing"), "{err}");
    Ok(())
}

#[test]
fn alexnet_capture_shapes() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let layers = alexnet::features(vb)?;
    let names: Vec<_> = layers.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names.len(), 13);
    assert_eq!(names.first(), Some(&"0"));
    assert_eq!(names.last(), Some(&"12"));

    let backbone = IntermediateLayers::new(layers, &[("9", "aux"), ("12", "out")])?;
    let xs = Tensor::zeros((2, 3, 64, 64), DType::F32, &Device::Cpu)?;
    let features = backbone.forward_features(&xs, false)?;
    assert_eq!(features.require("aux")?.dims(), &[2, 256, 3, 3]);
    assert_eq!(features.require("out")?.dims(), &[2, 256, 1, 1]);
    Ok(())
}

#[test]
fn resnet_layer_names() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let layers = resnet::resnet50_features(vb.clone())?;
    let names: Vec<_> = layers.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names.len(), 20);
    assert_eq!(&names[..5], ["conv1", "bn1", "relu", "maxpool", "layer1.0"]);
    assert_eq!(names.last(), Some(&"layer4.2"));

    let layers = resnet::resnet101_features(vb)?;
    assert_eq!(layers.len(), 37);
    assert_eq!(layers[33].0, "layer3.22");
    assert_eq!(layers[34].0, "layer4.0");
    Ok(())
}

#[test]
fn resnet_output_stride() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let layers = resnet::resnet50_features(vb)?;
    let backbone = IntermediateLayers::new(
        layers,
        &[(resnet::block_name(3, 5).as_str(), "aux"), ("layer4.2", "out")],
    )?;
    let xs = Tensor::zeros((1, 3, 64, 96), DType::F32, &Device::Cpu)?;
    let features = backbone.forward_features(&xs, false)?;
    assert_eq!(features.require("aux")?.dims(), &[1, 1024, 4, 6]);
    assert_eq!(
        features.require("out")?.dims(),
        &[1, resnet::FEATURE_CHANNELS, 2, 3]
    );
    Ok(())
}
