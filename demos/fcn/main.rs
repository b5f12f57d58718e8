//! FCN semantic segmentation.
//!
//! Runs one of the FCN variants on an image and reports how many pixels were
//! assigned to each class, optionally writing the colorized class mask.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example fcn --release -- \
//!     --which resnet50 \
//!     --model fcn_resnet50.safetensors \
//!     --image input.jpg \
//!     --output mask.png
//! ```
//!
//! Without `--model` the weights are randomly initialized, which is only useful to
//! check shapes and timings.

use candle::{DType, Device, IndexOp, Result, Tensor};
use candle_fcn::models::fcn::{BackboneKind, Config, Fcn};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use image::{ImageBuffer, Rgb};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const VOC_CLASSES: [&str; 21] = [
    "background",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Which {
    Alexnet,
    Resnet50,
    Resnet101,
}

impl Which {
    fn backbone(&self) -> BackboneKind {
        match self {
            Self::Alexnet => BackboneKind::AlexNet,
            Self::Resnet50 => BackboneKind::ResNet50,
            Self::Resnet101 => BackboneKind::ResNet101,
        }
    }
}

#[derive(Parser)]
#[command(about = "Semantic segmentation with fully convolutional networks")]
struct Args {
    /// Path to the safetensors weights, random weights are used when omitted.
    #[arg(long)]
    model: Option<String>,

    /// Path to a json model config, overrides --which and --num-classes.
    #[arg(long)]
    config: Option<String>,

    /// Variant of the model to use.
    #[arg(value_enum, long, default_value_t = Which::Resnet50)]
    which: Which,

    #[arg(long, default_value_t = 21)]
    num_classes: usize,

    /// Attach the auxiliary head (AlexNet only).
    #[arg(long)]
    aux: bool,

    /// Input image path.
    #[arg(long)]
    image: String,

    /// Resize the image to this height before running the model.
    #[arg(long, default_value_t = 224)]
    height: usize,

    /// Resize the image to this width before running the model.
    #[arg(long, default_value_t = 224)]
    width: usize,

    /// Where to write the colorized class mask.
    #[arg(long)]
    output: Option<String>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(device)
    }
}

fn load_image(path: &str, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let img = image::ImageReader::open(path)
        .map_err(candle::Error::wrap)?
        .decode()
        .map_err(candle::Error::wrap)?
        .resize_exact(
            width as u32,
            height as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();
    let data: Vec<f32> = img
        .pixels()
        .flat_map(|p| {
            p.0.iter()
                .enumerate()
                .map(|(c, &v)| (v as f32 / 255. - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
        })
        .collect();
    Tensor::from_vec(data, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .unsqueeze(0)
}

// The usual PASCAL VOC palette, bits of the class index spread over the channels.
fn class_color(class: u32) -> Rgb<u8> {
    let mut rgb = [0u8; 3];
    let mut class = class;
    for shift in (0..8).rev() {
        for (channel, value) in rgb.iter_mut().enumerate() {
            *value |= (((class >> channel) & 1) as u8) << shift;
        }
        class >>= 3;
    }
    rgb.into()
}

fn save_mask(mask: &[u32], height: usize, width: usize, path: &str) -> Result<()> {
    let mut img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::new(width as u32, height as u32);
    for (pixel, &class) in img.pixels_mut().zip(mask.iter()) {
        *pixel = class_color(class);
    }
    img.save(path).map_err(candle::Error::wrap)
}

pub fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = device(args.cpu)?;

    let config: Config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Config {
            backbone: args.which.backbone(),
            num_classes: args.num_classes,
            aux: Some(args.aux),
            ..Config::resnet50()
        },
    };
    println!("{config:?}");

    let image = load_image(&args.image, args.height, args.width, &device)?;
    println!("loaded image {image:?}");

    let varmap = VarMap::new();
    let vb = match &args.model {
        Some(model) => unsafe {
            VarBuilder::from_mmaped_safetensors(&[model], DType::F32, &device)?
        },
        None => {
            println!("no weights provided, using a random initialization");
            VarBuilder::from_varmap(&varmap, DType::F32, &device)
        }
    };
    let model = Fcn::new(&config, vb)?;
    println!("model built");

    let start = std::time::Instant::now();
    let output = model.forward(&image)?;
    println!("forward pass took {:?}", start.elapsed());
    for (name, scores) in output.iter() {
        println!("{name}: {:?}", scores.shape());
    }

    let mask = output.out.i(0)?.argmax(0)?;
    let (height, width) = mask.dims2()?;
    let mask = mask.flatten_all()?.to_vec1::<u32>()?;
    let mut counts = vec![0usize; config.num_classes];
    for &class in mask.iter() {
        counts[class as usize] += 1;
    }
    for (class, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let label = match VOC_CLASSES.get(class) {
            Some(label) if config.num_classes == VOC_CLASSES.len() => label.to_string(),
            _ => format!("class {class}"),
        };
        let share = 100. * count as f64 / mask.len() as f64;
        println!("{label:24}: {count:8} pixels ({share:.2}%)");
    }

    if let Some(path) = &args.output {
        save_mask(&mask, height, width, path)?;
        println!("mask written to {path}");
    }
    Ok(())
}
