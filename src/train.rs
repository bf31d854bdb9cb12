use anyhow::Result;
use burn::{
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::{
    checkpoint::Checkpointer,
    data::{MnistBatch, MnistLoader, num_batches},
    experiment::ExperimentConfig,
    metrics::{Accuracy, EpochMetrics, MetricsLogger, count_correct},
    resnet::ResNet,
    squeeze::FeatureSqueezing,
};

/// Runs the full epoch schedule, overwriting the checkpoint after every epoch.
pub fn train<B: AutodiffBackend>(
    config: &ExperimentConfig,
    mut model: ResNet<B>,
    loader: &MnistLoader<B>,
    squeezing: Option<&FeatureSqueezing>,
    checkpointer: &Checkpointer,
    metrics: &MetricsLogger,
) -> Result<ResNet<B>> {
    let mut optim = config.optimizer.init();
    let steps = num_batches(loader, config.batch_size);

    for epoch in 1..=config.num_epochs {
        let mut loss_sum = 0.0;
        let mut batches = 0usize;
        let mut accuracy = Accuracy::default();

        for (iteration, batch) in loader.iter().enumerate() {
            let batch = match squeezing {
                Some(squeezing) => MnistBatch {
                    images: squeezing.squeeze(batch.images),
                    targets: batch.targets,
                },
                None => batch,
            };
            let batch_size = batch.targets.dims()[0];

            let output = model.forward_classification(batch);
            let loss = output.loss.clone().into_scalar().elem::<f64>();
            loss_sum += loss;
            batches += 1;
            accuracy.record(count_correct(output.output, output.targets), batch_size);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(config.learning_rate, model, grads);

            if iteration % config.log_interval == 0 {
                tracing::info!(
                    "Epoch [{}/{}], Step [{}/{}], Loss: {:.4}",
                    epoch,
                    config.num_epochs,
                    iteration + 1,
                    steps,
                    loss
                );
            }
        }

        checkpointer.save(&model)?;
        tracing::info!("Checkpoint saved after epoch {epoch}.");

        let mean_loss = if batches > 0 {
            loss_sum / batches as f64
        } else {
            f64::NAN
        };
        metrics.log(&EpochMetrics {
            epoch,
            mean_loss,
            accuracy,
        })?;
        tracing::info!(
            "Epoch {epoch}: mean loss {mean_loss:.4}, training accuracy {accuracy}"
        );
    }

    Ok(model)
}
