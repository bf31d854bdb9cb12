use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use burn::{
    module::AutodiffModule, optim::AdamConfig, prelude::*, tensor::backend::AutodiffBackend,
};

use crate::{
    attack::{AttackLabels, FgsmConfig, PgdConfig},
    checkpoint::Checkpointer,
    data::{MnistLoader, test_loader, train_loader},
    eval::{adversarial_accuracy, clean_accuracy},
    metrics::{ExperimentReport, MetricsLogger},
    resnet::ResNetConfig,
    squeeze::FeatureSqueezingConfig,
    train::train,
};

#[derive(Config)]
pub struct ExperimentConfig {
    pub model: ResNetConfig,
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 128)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1)]
    pub seed: u64,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Log the training loss every this many batches.
    #[config(default = 100)]
    pub log_interval: usize,
    /// Defense applied to training batches; `None` trains on raw inputs.
    pub squeezing: Option<FeatureSqueezingConfig>,
    #[config(default = "FgsmConfig::new()")]
    pub fgsm: FgsmConfig,
    #[config(default = "PgdConfig::new()")]
    pub pgd: PgdConfig,
    #[config(default = "AttackLabels::Predicted")]
    pub attack_labels: AttackLabels,
    /// Stem of the weights file inside the artifact directory.
    #[config(default = "String::from(\"FeatureSqueezing\")")]
    pub checkpoint_name: String,
}

impl ExperimentConfig {
    /// Rejects settings that would only fail once training is under way.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.log_interval > 0, "log_interval must be positive");
        Ok(())
    }
}

/// Trains (or resumes) the model on MNIST, then measures clean and adversarial test accuracy.
pub fn run<B: AutodiffBackend>(
    artifact_dir: &str,
    config: ExperimentConfig,
    device: B::Device,
) -> Result<ExperimentReport> {
    config.validate()?;

    let loader_train = train_loader::<B>(&config, &device);
    let loader_test = test_loader::<B::InnerBackend>(&config, &device);

    run_with_loaders(
        Path::new(artifact_dir),
        config,
        device,
        loader_train,
        loader_test,
    )
}

/// Same pipeline as [run] over caller-provided training and test loaders.
pub fn run_with_loaders<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: ExperimentConfig,
    device: B::Device,
    loader_train: MnistLoader<B>,
    loader_test: MnistLoader<B::InnerBackend>,
) -> Result<ExperimentReport> {
    config.validate()?;

    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("cannot create '{}'", artifact_dir.display()))?;
    config
        .save(artifact_dir.join("config.json"))
        .context("cannot write config.json")?;

    // Fail on bad hyperparameters before spending time on training.
    let squeezing = config
        .squeezing
        .as_ref()
        .map(FeatureSqueezingConfig::init)
        .transpose()?;
    let fgsm = config.fgsm.init()?;
    let pgd = config.pgd.init()?;

    B::seed(config.seed);

    if let Some(batch) = loader_train.iter().next() {
        tracing::info!("Image batch dimensions: {:?}", batch.images.dims());
        tracing::info!("Image label dimensions: {:?}", batch.targets.dims());
    }

    let mut model = config.model.init::<B>(&device);
    let checkpointer = Checkpointer::new(artifact_dir, &config.checkpoint_name);
    if checkpointer.exists() {
        model = checkpointer.load(model, &device)?;
        tracing::info!("Model loaded from '{}'.", checkpointer.path().display());
    }

    let metrics = MetricsLogger::new(artifact_dir)?;
    let model = train(
        &config,
        model,
        &loader_train,
        squeezing.as_ref(),
        &checkpointer,
        &metrics,
    )?;
    tracing::info!("Per-epoch metrics in '{}'", metrics.csv_path().display());

    let clean = clean_accuracy(&model.valid(), &loader_test);
    tracing::info!("Accuracy of the model on the test images: {clean}");

    let fgsm = adversarial_accuracy(&model, &fgsm, config.attack_labels, &loader_test)?;
    tracing::info!(
        "Accuracy on FGSM adversarial examples over the entire test set: {} ({:.2} seconds)",
        fgsm.accuracy,
        fgsm.elapsed_secs
    );

    let pgd = adversarial_accuracy(&model, &pgd, config.attack_labels, &loader_test)?;
    tracing::info!(
        "Accuracy on PGD adversarial examples over the entire test set: {}",
        pgd.accuracy
    );
    tracing::info!("Total time required: {:.2} seconds", pgd.elapsed_secs);

    let report = ExperimentReport { clean, fgsm, pgd };
    report.save(artifact_dir.join("report.json"))?;

    Ok(report)
}
