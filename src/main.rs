#![recursion_limit = "256"]

mod attack;
mod checkpoint;
mod data;
mod eval;
mod experiment;
mod metrics;
mod resnet;
mod squeeze;
mod train;

use anyhow::Result;
use burn::{backend::Autodiff, optim::AdamConfig};
use tracing_subscriber::EnvFilter;

use crate::{
    attack::{FgsmConfig, PgdConfig},
    experiment::ExperimentConfig,
    resnet::ResNetConfig,
    squeeze::FeatureSqueezingConfig,
};

pub static ARTIFACT_DIR: &str = "./tmp/resnet34-mnist-squeeze";

const RANDOM_SEED: u64 = 1;
const LEARNING_RATE: f64 = 0.001;
const BATCH_SIZE: usize = 128;
const NUM_EPOCHS: usize = 10;

const NUM_CLASSES: usize = 10;
const GRAYSCALE: bool = true;

#[cfg(not(any(
    feature = "ndarray",
    feature = "wgpu",
    feature = "metal",
    feature = "tch-gpu"
)))]
compile_error!("enable one backend feature: ndarray, wgpu, metal or tch-gpu");

#[cfg(feature = "tch-gpu")]
mod backend {
    use burn::backend::libtorch::{LibTorch, LibTorchDevice};

    pub type Backend = LibTorch;

    pub fn device() -> LibTorchDevice {
        LibTorchDevice::Cuda(0)
    }
}

#[cfg(all(feature = "wgpu", not(feature = "tch-gpu")))]
mod backend {
    use burn::backend::wgpu::{Wgpu, WgpuDevice};

    pub type Backend = Wgpu;

    pub fn device() -> WgpuDevice {
        WgpuDevice::default()
    }
}

#[cfg(all(feature = "metal", not(any(feature = "tch-gpu", feature = "wgpu"))))]
mod backend {
    use burn::backend::wgpu::{Metal, WgpuDevice};

    pub type Backend = Metal;

    pub fn device() -> WgpuDevice {
        WgpuDevice::default()
    }
}

#[cfg(all(
    feature = "ndarray",
    not(any(feature = "tch-gpu", feature = "wgpu", feature = "metal"))
))]
mod backend {
    use burn::backend::ndarray::{NdArray, NdArrayDevice};

    pub type Backend = NdArray;

    pub fn device() -> NdArrayDevice {
        NdArrayDevice::Cpu
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let input_channels = if GRAYSCALE { 1 } else { 3 };
    let config = ExperimentConfig::new(
        ResNetConfig::resnet34(NUM_CLASSES, input_channels),
        AdamConfig::new(),
    )
    .with_seed(RANDOM_SEED)
    .with_learning_rate(LEARNING_RATE)
    .with_batch_size(BATCH_SIZE)
    .with_num_epochs(NUM_EPOCHS)
    .with_squeezing(Some(
        FeatureSqueezingConfig::new()
            .with_bit_depth(1)
            .with_clip_min(0.0)
            .with_clip_max(1.0),
    ))
    .with_fgsm(FgsmConfig::new().with_epsilon(0.2))
    .with_pgd(PgdConfig::new().with_epsilon(0.1).with_max_iter(40));

    let device = backend::device();
    tracing::info!("Using device {device:?}");

    experiment::run::<Autodiff<backend::Backend>>(ARTIFACT_DIR, config, device)?;

    Ok(())
}
