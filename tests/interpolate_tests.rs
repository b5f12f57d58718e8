use anyhow::Result;
use candle::{test_utils, DType, Device, IndexOp, ModuleT, Tensor};
use candle_fcn::models::fcn::{self, Fcn, HeadConfig, IntermediateLayers, OUT};
use candle_nn::{FuncT, VarBuilder, VarMap};

// Score maps are resized with torch.nn.functional.interpolate(mode="bilinear",
// align_corners=False), the reference values below come from PyTorch.
fn resize(xs: &Tensor, h: usize, w: usize) -> candle::Result<Tensor> {
    xs.upsample_bilinear2d(h, w, false)
}

#[test]
fn upscale_2x() -> Result<()> {
    let input = Tensor::arange(0f32, 16f32, &Device::Cpu)?.reshape((1, 1, 4, 4))?;
    let output = resize(&input, 8, 8)?;
    assert_eq!(output.dims(), &[1, 1, 8, 8]);
    let t = [0f32, 0.25, 0.75, 1.25, 1.75, 2.25, 2.75, 3.0];
    let expected: Vec<Vec<f32>> = t
        .iter()
        .map(|r| t.iter().map(|c| 4. * r + c).collect())
        .collect();
    assert_eq!(test_utils::to_vec2_round(&output.i((0, 0))?, 4)?, expected);
    Ok(())
}

#[test]
fn downscale_2x() -> Result<()> {
    let input = Tensor::arange(0f32, 64f32, &Device::Cpu)?.reshape((1, 1, 8, 8))?;
    let output = resize(&input, 4, 4)?;
    assert_eq!(
        test_utils::to_vec2_round(&output.i((0, 0))?, 4)?,
        &[
            [4.5, 6.5, 8.5, 10.5],
            [20.5, 22.5, 24.5, 26.5],
            [36.5, 38.5, 40.5, 42.5],
            [52.5, 54.5, 56.5, 58.5]
        ]
    );
    Ok(())
}

#[test]
fn non_square() -> Result<()> {
    let input = Tensor::arange(0f32, 24f32, &Device::Cpu)?.reshape((1, 1, 4, 6))?;
    let output = resize(&input, 8, 12)?;
    assert_eq!(output.dims(), &[1, 1, 8, 12]);
    let rows = test_utils::to_vec2_round(&output.i((0, 0))?, 4)?;
    assert_eq!(
        rows[0],
        &[0.0, 0.25, 0.75, 1.25, 1.75, 2.25, 2.75, 3.25, 3.75, 4.25, 4.75, 5.0]
    );
    assert_eq!(
        rows[7],
        &[18.0, 18.25, 18.75, 19.25, 19.75, 20.25, 20.75, 21.25, 21.75, 22.25, 22.75, 23.0]
    );
    Ok(())
}

#[test]
fn tiny_inputs() -> Result<()> {
    let input = Tensor::new(&[2f32, 8.], &Device::Cpu)?.reshape((1, 1, 1, 2))?;
    let output = resize(&input, 3, 6)?;
    let row = [2f32, 2., 4., 6., 8., 8.];
    assert_eq!(
        test_utils::to_vec2_round(&output.i((0, 0))?, 4)?,
        &[row, row, row]
    );
    Ok(())
}

#[test]
fn f64_keeps_full_precision() -> Result<()> {
    // 3 -> 7 samples the source at 0, 1/7, 4/7, 1, 10/7, 13/7 and clamps the last one.
    let input = Tensor::new(&[0f64, 1., 2.], &Device::Cpu)?.reshape((1, 1, 1, 3))?;
    let output = resize(&input, 1, 7)?;
    assert_eq!(output.dtype(), DType::F64);
    let expected = [0., 1. / 7., 4. / 7., 1., 10. / 7., 13. / 7., 2.];
    let output = output.flatten_all()?.to_vec1::<f64>()?;
    for (o, e) in output.iter().zip(expected.iter()) {
        assert!((o - e).abs() < 1e-12, "{output:?}");
    }
    Ok(())
}

#[test]
fn model_output_is_resized_head_output() -> Result<()> {
    let layers = vec![(
        "pool".to_string(),
        FuncT::new(|xs: &Tensor, _| xs.avg_pool2d(3)),
    )];
    let backbone = IntermediateLayers::new(layers, &[("pool", OUT)])?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let head = HeadConfig {
        compress: 2,
        ..HeadConfig::new(4, 3)
    };
    let model = Fcn::with_backbone(Box::new(backbone), head, None, vb)?;

    let xs = Tensor::randn(0f32, 1f32, (1, 4, 13, 9), &Device::Cpu)?;
    let output = model.forward(&xs)?;
    let scores = model.classifier().forward_t(&xs.avg_pool2d(3)?, false)?;
    let expected = resize(&scores, 13, 9)?;
    let diff = (output.out - expected)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_vec0::<f32>()?;
    assert_eq!(diff, 0.);
    Ok(())
}

#[test]
fn model_runs_in_f64() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F64, &Device::Cpu);
    let model = fcn::fcn_alexnet(4, true, vb)?;
    let xs = Tensor::zeros((1, 3, 64, 64), DType::F64, &Device::Cpu)?;
    let output = model.forward(&xs)?;
    for (_, ys) in output.iter() {
        assert_eq!(ys.dtype(), DType::F64);
        assert_eq!(ys.dims(), &[1, 4, 64, 64]);
    }
    Ok(())
}

#[test]
fn model_rejects_integer_input() -> Result<()> {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let model = fcn::fcn_alexnet(21, false, vb)?;
    for dtype in [DType::U8, DType::U32] {
        let xs = Tensor::zeros((1, 3, 64, 64), dtype, &Device::Cpu)?;
        let err = model.forward(&xs).unwrap_err();
        assert!(err.to_string().contains("floating point"), "{err}");
    }
    Ok(())
}
